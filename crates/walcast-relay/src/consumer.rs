//! Change stream consumer.
//!
//! Owns one upstream subscription and turns its batches into broadcasts. For
//! every batch the checkpoint is saved first, then events are emitted, then
//! the upstream is acknowledged.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};
use walcast_core::{ChangeBatch, ChangeDecoder, ChangeEvent, ChangeSource, Lsn, SourceConnector};
use walcast_state::CheckpointStore;

/// Receives decoded change events.
pub trait EventSink: Send + Sync {
    /// Deliver one event; returns how many recipients it reached.
    fn publish(&self, event: &ChangeEvent) -> impl Future<Output = usize> + Send;
}

/// Why [`Consumer::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The stop future resolved.
    Stopped,
    /// The upstream reported the end of its stream.
    StreamEnded,
}

pub struct Consumer<S, K> {
    source: S,
    decoder: Box<dyn ChangeDecoder>,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: K,
    /// Highest position known to be handled: the loaded checkpoint, then
    /// every processed batch.
    position: Option<Lsn>,
}

impl<S, K> Consumer<S, K>
where
    S: ChangeSource,
    K: EventSink,
{
    pub fn new(
        source: S,
        decoder: Box<dyn ChangeDecoder>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: K,
        checkpoint: Option<Lsn>,
    ) -> Self {
        Self {
            source,
            decoder,
            checkpoints,
            sink,
            position: checkpoint,
        }
    }

    /// Load the checkpoint and open a subscription resuming after it.
    ///
    /// An unreadable checkpoint is logged and treated as absent.
    pub async fn open<C>(
        connector: &C,
        decoder: Box<dyn ChangeDecoder>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: K,
    ) -> walcast_core::Result<Self>
    where
        C: SourceConnector<Source = S>,
    {
        let checkpoint = match checkpoints.load() {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(error = %e, "Failed to load checkpoint, starting from slot position");
                None
            }
        };

        let source = connector.connect(checkpoint).await?;
        Ok(Self::new(source, decoder, checkpoints, sink, checkpoint))
    }

    pub fn position(&self) -> Option<Lsn> {
        self.position
    }

    /// Process batches until `stop` resolves, the stream ends, or the
    /// upstream fails.
    ///
    /// `stop` is only observed while waiting for the next batch, so a batch
    /// that has started is always finished and acknowledged.
    pub async fn run<F>(&mut self, stop: F) -> walcast_core::Result<ConsumerExit>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut stop => return Ok(ConsumerExit::Stopped),
                next = self.source.next_batch() => next?,
            };

            let Some(batch) = next else {
                return Ok(ConsumerExit::StreamEnded);
            };

            self.process(batch).await?;
        }
    }

    /// Handle one batch: save, emit, acknowledge.
    pub async fn process(&mut self, batch: ChangeBatch) -> walcast_core::Result<()> {
        let lsn = batch.lsn;

        if self.position.is_some_and(|position| lsn <= position) {
            debug!(lsn = %lsn, "Skipping batch at or before checkpoint");
            return self.source.acknowledge(lsn).await;
        }

        let events = match self.decoder.decode(&batch) {
            Ok(events) => events,
            Err(e) => {
                warn!(lsn = %lsn, error = %e, "Skipping undecodable batch");
                Vec::new()
            }
        };

        if let Err(e) = self.checkpoints.save(lsn) {
            warn!(lsn = %lsn, error = %e, "Failed to save checkpoint");
        }
        self.position = Some(lsn);

        for event in &events {
            self.sink.publish(event).await;
        }

        self.source.acknowledge(lsn).await?;

        debug!(lsn = %lsn, events = events.len(), "Processed batch");
        Ok(())
    }

    /// Tear down the upstream subscription.
    pub async fn close(&mut self) {
        self.source.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use walcast_core::DecodeFormat;
    use walcast_state::MemoryCheckpointStore;

    use crate::mock::{MockConnector, MockEvent};

    #[derive(Default)]
    struct RecordingSink {
        tables: Mutex<Vec<Option<String>>>,
    }

    impl EventSink for Arc<RecordingSink> {
        async fn publish(&self, event: &ChangeEvent) -> usize {
            self.tables.lock().unwrap().push(event.table.clone());
            1
        }
    }

    fn v1_insert(table: &str) -> String {
        format!(
            r#"{{"change":[{{"kind":"insert","schema":"public","table":"{}","columnnames":["id"],"columntypes":["integer"],"columnvalues":[1]}}]}}"#,
            table
        )
    }

    fn batch(lsn: u64, table: &str) -> ChangeBatch {
        ChangeBatch::new(Lsn::new(lsn), v1_insert(table))
    }

    async fn open(
        connector: &MockConnector,
        store: Arc<MemoryCheckpointStore>,
        sink: Arc<RecordingSink>,
    ) -> Consumer<crate::mock::MockSource, Arc<RecordingSink>> {
        Consumer::open(connector, DecodeFormat::Wal2JsonV1.decoder(), store, sink)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_saves_emits_and_acknowledges_in_order() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink::default());
        let mut consumer = open(&connector, store.clone(), sink.clone()).await;

        consumer.process(batch(0x10, "orders")).await.unwrap();
        consumer.process(batch(0x20, "users")).await.unwrap();

        assert_eq!(store.history(), vec![Lsn::new(0x10), Lsn::new(0x20)]);
        assert_eq!(
            *sink.tables.lock().unwrap(),
            vec![Some("orders".to_string()), Some("users".to_string())]
        );
        assert_eq!(connector.acks(), vec![Lsn::new(0x10), Lsn::new(0x20)]);
        assert_eq!(consumer.position(), Some(Lsn::new(0x20)));
    }

    #[tokio::test]
    async fn test_resumes_from_loaded_checkpoint() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryCheckpointStore::with_checkpoint(Lsn::new(0x20)));
        let sink = Arc::new(RecordingSink::default());
        let mut consumer = open(&connector, store.clone(), sink.clone()).await;

        assert_eq!(connector.connects(), vec![Some(Lsn::new(0x20))]);

        consumer.process(batch(0x10, "old")).await.unwrap();
        consumer.process(batch(0x20, "old")).await.unwrap();
        consumer.process(batch(0x30, "new")).await.unwrap();

        assert_eq!(store.history(), vec![Lsn::new(0x30)]);
        assert_eq!(*sink.tables.lock().unwrap(), vec![Some("new".to_string())]);
        // Skipped batches are still released upstream.
        assert_eq!(
            connector.acks(),
            vec![Lsn::new(0x10), Lsn::new(0x20), Lsn::new(0x30)]
        );
    }

    #[tokio::test]
    async fn test_checkpoint_never_regresses() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink::default());
        let mut consumer = open(&connector, store.clone(), sink.clone()).await;

        for lsn in [0x10, 0x30, 0x20, 0x30, 0x40] {
            consumer.process(batch(lsn, "orders")).await.unwrap();
        }

        let history = store.history();
        assert_eq!(history, vec![Lsn::new(0x10), Lsn::new(0x30), Lsn::new(0x40)]);
        assert!(history.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_interleaved_v2_transactions_are_all_delivered() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink::default());
        let mut consumer = Consumer::open(
            &connector,
            DecodeFormat::Wal2JsonV2.decoder(),
            store.clone(),
            sink.clone(),
        )
        .await
        .unwrap();

        // Transaction A writes first but commits after transaction B.
        let output = [
            (0x1f0, r#"{"action":"B"}"#),
            (0x200, r#"{"action":"I","schema":"public","table":"b"}"#),
            (0x250, r#"{"action":"C"}"#),
            (0x0f0, r#"{"action":"B"}"#),
            (0x100, r#"{"action":"I","schema":"public","table":"a"}"#),
            (0x300, r#"{"action":"C"}"#),
        ]
        .into_iter()
        .map(|(lsn, data)| (Lsn::new(lsn), data.to_string()))
        .collect();

        for batch in DecodeFormat::Wal2JsonV2.assemble(output) {
            consumer.process(batch).await.unwrap();
        }

        assert_eq!(
            *sink.tables.lock().unwrap(),
            vec![Some("b".to_string()), Some("a".to_string())]
        );
        assert_eq!(store.history(), vec![Lsn::new(0x250), Lsn::new(0x300)]);
        assert_eq!(connector.acks(), vec![Lsn::new(0x250), Lsn::new(0x300)]);
    }

    #[tokio::test]
    async fn test_undecodable_batch_still_advances() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink::default());
        let mut consumer = open(&connector, store.clone(), sink.clone()).await;

        consumer
            .process(ChangeBatch::new(Lsn::new(0x10), "{not json"))
            .await
            .unwrap();

        assert!(sink.tables.lock().unwrap().is_empty());
        assert_eq!(store.history(), vec![Lsn::new(0x10)]);
        assert_eq!(connector.acks(), vec![Lsn::new(0x10)]);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_not_fatal() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        store.set_fail_saves(true);
        let sink = Arc::new(RecordingSink::default());
        let mut consumer = open(&connector, store.clone(), sink.clone()).await;

        consumer.process(batch(0x10, "orders")).await.unwrap();

        assert_eq!(sink.tables.lock().unwrap().len(), 1);
        assert_eq!(connector.acks(), vec![Lsn::new(0x10)]);
        assert_eq!(consumer.position(), Some(Lsn::new(0x10)));
    }

    #[tokio::test]
    async fn test_run_surfaces_upstream_error() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink::default());
        let mut consumer = open(&connector, store, sink.clone()).await;

        connector.push(MockEvent::Batch(batch(0x10, "orders")));
        connector.push(MockEvent::Fail("connection reset".to_string()));

        let result = consumer.run(std::future::pending()).await;
        assert!(result.is_err());
        assert_eq!(sink.tables.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_reports_stream_end_and_stop() {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink::default());

        let mut consumer = open(&connector, store.clone(), sink.clone()).await;
        connector.push(MockEvent::End);
        assert_eq!(
            consumer.run(std::future::pending()).await.unwrap(),
            ConsumerExit::StreamEnded
        );

        let mut consumer = open(&connector, store, sink).await;
        assert_eq!(
            consumer.run(std::future::ready(())).await.unwrap(),
            ConsumerExit::Stopped
        );
    }
}
