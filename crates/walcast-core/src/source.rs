//! The seam between the relay and the upstream logical replication source.

use std::future::Future;

use crate::error::Result;
use crate::lsn::Lsn;
use crate::types::ChangeBatch;

/// One live subscription to the upstream change stream.
pub trait ChangeSource: Send {
    /// Wait for the next committed batch.
    ///
    /// `Ok(None)` means the stream ended; `Err` is a terminal failure of this
    /// subscription. Never called concurrently with itself.
    fn next_batch(&mut self) -> impl Future<Output = Result<Option<ChangeBatch>>> + Send;

    /// Tell the upstream that everything up to `lsn` has been handled.
    fn acknowledge(&mut self, lsn: Lsn) -> impl Future<Output = Result<()>> + Send;

    /// Tear the subscription down and wait for it to finish. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens subscriptions to the upstream change stream.
pub trait SourceConnector: Send + Sync + 'static {
    type Source: ChangeSource + 'static;

    /// Open a subscription, resuming after `start` when it is known.
    fn connect(&self, start: Option<Lsn>) -> impl Future<Output = Result<Self::Source>> + Send;
}
