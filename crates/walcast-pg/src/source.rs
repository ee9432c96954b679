//! Polling wal2json source.
//!
//! Changes are read with `pg_logical_slot_peek_changes`, which leaves them in
//! the slot, and consumed with `pg_logical_slot_get_changes` only once the
//! relay acknowledges them.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_postgres::Client;
use tracing::{debug, info};
use walcast_core::{ChangeBatch, ChangeSource, DecodeFormat, Lsn, SourceConnector};

use crate::connect::connect_postgres;
use crate::error::{PgError, PgResult};
use crate::slot::ensure_slot;

/// Configuration for the wal2json slot source.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Postgres connection string.
    pub connection_string: String,
    /// Replication slot name.
    pub slot_name: String,
    /// Whether to create the slot if it doesn't exist.
    pub create_slot: bool,
    /// wal2json output format requested from the slot.
    pub format: DecodeFormat,
    /// Delay between polls when the slot has nothing new.
    pub poll_interval: Duration,
    /// Upper bound on rows fetched per poll.
    pub max_changes: u32,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            slot_name: "miscellaneous".to_string(),
            create_slot: true,
            format: DecodeFormat::default(),
            poll_interval: Duration::from_millis(250),
            max_changes: 1000,
        }
    }
}

/// Opens [`Wal2JsonSource`] subscriptions.
#[derive(Debug, Clone)]
pub struct Wal2JsonConnector {
    config: SlotConfig,
}

impl Wal2JsonConnector {
    pub fn new(config: SlotConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SlotConfig {
        &self.config
    }
}

impl SourceConnector for Wal2JsonConnector {
    type Source = Wal2JsonSource;

    async fn connect(&self, start: Option<Lsn>) -> walcast_core::Result<Wal2JsonSource> {
        Ok(Wal2JsonSource::connect(self.config.clone(), start).await?)
    }
}

/// One session against a wal2json replication slot.
pub struct Wal2JsonSource {
    client: Option<Client>,
    connection: Option<JoinHandle<()>>,
    config: SlotConfig,
    peek_sql: String,
    ack_sql: String,
    pending: VecDeque<ChangeBatch>,
    /// Highest position handed out in this session.
    delivered_upto: Option<Lsn>,
    /// Highest position consumed from the slot in this session.
    acked_upto: Option<Lsn>,
}

impl Wal2JsonSource {
    /// Connect, make sure the slot exists, and prepare to poll it.
    ///
    /// The slot always redelivers from its confirmed position; `start` is
    /// only logged here and honored by the consumer skipping old batches.
    pub async fn connect(config: SlotConfig, start: Option<Lsn>) -> PgResult<Self> {
        info!(
            slot = %config.slot_name,
            format = %config.format,
            start = ?start.map(|lsn| lsn.to_string()),
            "Connecting to replication slot"
        );

        let (client, connection) = connect_postgres(&config.connection_string).await?;

        if let Err(e) = ensure_slot(&client, &config.slot_name, config.create_slot).await {
            drop(client);
            let _ = connection.await;
            return Err(e);
        }

        Ok(Self {
            client: Some(client),
            connection: Some(connection),
            peek_sql: peek_query(config.format),
            ack_sql: ack_query(config.format),
            config,
            pending: VecDeque::new(),
            delivered_upto: None,
            acked_upto: None,
        })
    }

    fn client(&self) -> PgResult<&Client> {
        match &self.client {
            Some(client) if !client.is_closed() => Ok(client),
            _ => Err(PgError::ConnectionClosed),
        }
    }

    /// Fetch the next rows from the slot without consuming them.
    async fn poll(&mut self) -> PgResult<usize> {
        let limit = i32::try_from(self.config.max_changes).unwrap_or(i32::MAX);
        let rows = self
            .client()?
            .query(self.peek_sql.as_str(), &[&self.config.slot_name, &limit])
            .await?;

        let mut output = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn_text: String = row.try_get(0)?;
            let data: Option<String> = row.try_get(1)?;
            output.push((Lsn::parse(&lsn_text)?, data.unwrap_or_default()));
        }

        let fresh = unseen_batches(self.config.format, output, self.delivered_upto);
        let queued = fresh.len();
        self.pending.extend(fresh);

        if queued > 0 {
            debug!(slot = %self.config.slot_name, count = queued, "Polled slot");
        }

        Ok(queued)
    }

    async fn next(&mut self) -> PgResult<Option<ChangeBatch>> {
        loop {
            if let Some(batch) = self.pending.pop_front() {
                self.delivered_upto = Some(batch.lsn);
                return Ok(Some(batch));
            }

            if self.poll().await? == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    async fn consume(&mut self, lsn: Lsn) -> PgResult<()> {
        if self.acked_upto.is_some_and(|upto| lsn <= upto) {
            return Ok(());
        }

        let upto = lsn.to_string();
        self.client()?
            .execute(self.ack_sql.as_str(), &[&self.config.slot_name, &upto])
            .await?;

        self.acked_upto = Some(lsn);
        debug!(slot = %self.config.slot_name, lsn = %lsn, "Acknowledged LSN");

        Ok(())
    }
}

impl ChangeSource for Wal2JsonSource {
    async fn next_batch(&mut self) -> walcast_core::Result<Option<ChangeBatch>> {
        Ok(self.next().await?)
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> walcast_core::Result<()> {
        Ok(self.consume(lsn).await?)
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            debug!(slot = %self.config.slot_name, "Closing replication session");
        }
        self.pending.clear();

        if let Some(connection) = self.connection.take() {
            let _ = connection.await;
        }
    }
}

/// Batches from one peek that were not handed out earlier in the session.
///
/// Every peek starts again from the slot's confirmed position, so batches at
/// or below `delivered_upto` are repeats.
fn unseen_batches(
    format: DecodeFormat,
    rows: Vec<(Lsn, String)>,
    delivered_upto: Option<Lsn>,
) -> Vec<ChangeBatch> {
    format
        .assemble(rows)
        .into_iter()
        .filter(|batch| delivered_upto.map_or(true, |upto| batch.lsn > upto))
        .collect()
}

fn plugin_args(format: DecodeFormat) -> String {
    format
        .plugin_options()
        .iter()
        .map(|(key, value)| format!(", '{}', '{}'", key, value))
        .collect()
}

fn peek_query(format: DecodeFormat) -> String {
    format!(
        "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2{})",
        plugin_args(format)
    )
}

fn ack_query(format: DecodeFormat) -> String {
    format!(
        "SELECT lsn::text FROM pg_logical_slot_get_changes($1, $2::text::pg_lsn, NULL{})",
        plugin_args(format)
    )
}
