use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use walcast_core::DecodeFormat;

#[derive(Parser)]
#[command(name = "walcast")]
#[command(about = "Relay Postgres logical replication changes to WebSocket subscribers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay
    Run(RunArgs),

    /// Create the replication slot if it does not exist
    Setup {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Show the local checkpoint and the replication slot status
    Status {
        #[command(flatten)]
        source: SourceArgs,

        /// File holding the last acknowledged LSN
        #[arg(long, env = "LSN_FILE", default_value = "./replication.lsn")]
        lsn_file: PathBuf,
    },
}

/// Where to find the upstream database and slot.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Replication slot name
    #[arg(long, env = "REPLICATION_SLOT", default_value = "miscellaneous")]
    pub slot: String,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "4000")]
    pub port: u16,

    /// Shared secret clients must present
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// File holding the last acknowledged LSN
    #[arg(long, env = "LSN_FILE", default_value = "./replication.lsn")]
    pub lsn_file: PathBuf,

    /// wal2json output format (v1 or v2)
    #[arg(long, env = "WAL2JSON_FORMAT", default_value = "v1")]
    pub format: DecodeFormat,

    /// Create the replication slot if it doesn't exist
    #[arg(long, env = "CREATE_SLOT", default_value = "true", action = clap::ArgAction::Set)]
    pub create_slot: bool,

    /// Poll interval in milliseconds when the slot is idle
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "250")]
    pub poll_interval_ms: u64,

    /// Maximum changes fetched per poll
    #[arg(long, env = "MAX_CHANGES", default_value = "1000")]
    pub max_changes: u32,

    /// Initial restart delay in milliseconds
    #[arg(long, env = "MIN_BACKOFF_MS", default_value = "1000")]
    pub min_backoff_ms: u64,

    /// Restart delay ceiling in milliseconds
    #[arg(long, env = "MAX_BACKOFF_MS", default_value = "30000")]
    pub max_backoff_ms: u64,

    /// Maximum concurrent client connections
    #[arg(long, env = "MAX_CONNECTIONS", default_value = "1024")]
    pub max_connections: usize,

    /// Outbound message queue depth per client
    #[arg(long, env = "CLIENT_BUFFER", default_value = "1024")]
    pub client_buffer: usize,

    /// Seconds to wait for upstream teardown and client drain on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "10")]
    pub shutdown_grace_secs: u64,
}
