//! Replication slot management.
//!
//! Handles creating and verifying the wal2json logical replication slot.

use tokio_postgres::Client;
use tracing::info;
use walcast_core::Lsn;

use crate::error::{PgError, PgResult};

/// Output plugin every walcast slot is decoded with.
pub const OUTPUT_PLUGIN: &str = "wal2json";

/// Check if a replication slot exists.
pub async fn slot_exists(client: &Client, slot_name: &str) -> PgResult<bool> {
    let exists: bool = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
            &[&slot_name],
        )
        .await?
        .get(0);

    Ok(exists)
}

/// Get the plugin used by a replication slot.
pub async fn get_slot_plugin(client: &Client, slot_name: &str) -> PgResult<Option<String>> {
    let row = client
        .query_opt(
            "SELECT plugin FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;

    Ok(row.and_then(|r| r.get(0)))
}

/// Create a logical replication slot decoded by wal2json.
pub async fn create_slot(client: &Client, slot_name: &str) -> PgResult<()> {
    info!(slot = %slot_name, plugin = OUTPUT_PLUGIN, "Creating replication slot");
    client
        .execute(
            "SELECT pg_create_logical_replication_slot($1, 'wal2json')",
            &[&slot_name],
        )
        .await
        .map_err(|e| PgError::SlotCreationFailed(PgError::from(e).to_string()))?;

    Ok(())
}

/// Drop a replication slot.
pub async fn drop_slot(client: &Client, slot_name: &str) -> PgResult<()> {
    info!(slot = %slot_name, "Dropping replication slot");
    client
        .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name])
        .await?;

    Ok(())
}

/// Ensure a replication slot exists and is decoded by wal2json.
///
/// A missing slot is created when `create_if_missing` is set. A slot bound
/// to another output plugin is left untouched and reported as an error, since
/// dropping it would discard the changes it retains.
pub async fn ensure_slot(client: &Client, slot_name: &str, create_if_missing: bool) -> PgResult<()> {
    if slot_exists(client, slot_name).await? {
        let plugin = get_slot_plugin(client, slot_name).await?;

        if plugin.as_deref() != Some(OUTPUT_PLUGIN) {
            return Err(PgError::SlotPluginMismatch {
                slot: slot_name.to_string(),
                expected: OUTPUT_PLUGIN.to_string(),
                actual: plugin,
            });
        }

        info!(slot = %slot_name, "Using existing replication slot");
    } else if create_if_missing {
        create_slot(client, slot_name).await?;
    } else {
        return Err(PgError::SlotNotFound(slot_name.to_string()));
    }

    Ok(())
}

/// Server-side view of a replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub slot_name: String,
    pub plugin: Option<String>,
    pub active: bool,
    pub restart_lsn: Option<Lsn>,
    pub confirmed_flush_lsn: Option<Lsn>,
}

/// Read the status of a slot, or `None` when it does not exist.
pub async fn slot_status(client: &Client, slot_name: &str) -> PgResult<Option<SlotStatus>> {
    let row = client
        .query_opt(
            "SELECT plugin, active, restart_lsn::text, confirmed_flush_lsn::text \
             FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let restart_lsn: Option<String> = row.try_get(2)?;
    let confirmed_flush_lsn: Option<String> = row.try_get(3)?;

    Ok(Some(SlotStatus {
        slot_name: slot_name.to_string(),
        plugin: row.try_get(0)?,
        active: row.try_get(1)?,
        restart_lsn: restart_lsn.as_deref().map(Lsn::parse).transpose()?,
        confirmed_flush_lsn: confirmed_flush_lsn.as_deref().map(Lsn::parse).transpose()?,
    }))
}
