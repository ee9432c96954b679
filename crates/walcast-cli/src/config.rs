use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use walcast_pg::SlotConfig;
use walcast_relay::RelayConfig;

use crate::cli::{RunArgs, SourceArgs};

/// Everything `walcast run` needs, resolved from flags and environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub slot: SlotConfig,
    pub relay: RelayConfig,
    pub lsn_file: PathBuf,
}

impl SourceArgs {
    /// The connection string; its absence is a fatal configuration error.
    pub fn database_url(&self) -> Result<String> {
        self.database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .context("DATABASE_URL is not set. Pass --database-url or set it in the environment or .env")
    }

    pub fn slot_config(&self) -> Result<SlotConfig> {
        Ok(SlotConfig {
            connection_string: self.database_url()?,
            slot_name: self.slot.clone(),
            ..SlotConfig::default()
        })
    }
}

impl RunArgs {
    pub fn into_config(self) -> Result<RunConfig> {
        let slot = SlotConfig {
            create_slot: self.create_slot,
            format: self.format,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_changes: self.max_changes,
            ..self.source.slot_config()?
        };

        let relay = RelayConfig {
            listen_addr: listen_addr(&self.host, self.port),
            auth_token: self.auth_token,
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_connections: self.max_connections,
            client_buffer: self.client_buffer,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        };
        relay.validate().context("Invalid relay configuration")?;

        Ok(RunConfig {
            slot,
            relay,
            lsn_file: self.lsn_file,
        })
    }
}

/// `host:port`, bracketing IPv6 literals.
fn listen_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
