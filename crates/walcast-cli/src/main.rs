use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use cli::{Cli, Commands, RunArgs, SourceArgs};
use walcast_pg::{connect_postgres, ensure_slot, slot_status, Wal2JsonConnector};
use walcast_relay::Relay;
use walcast_state::{CheckpointStore, FileCheckpointStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("walcast=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Setup { source } => cmd_setup(source).await,
        Commands::Status { source, lsn_file } => cmd_status(source, &lsn_file).await,
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = args.into_config()?;

    let store = Arc::new(FileCheckpointStore::new(&config.lsn_file));
    let connector = Wal2JsonConnector::new(config.slot.clone());

    info!(
        slot = %config.slot.slot_name,
        lsn_file = %config.lsn_file.display(),
        "Starting walcast"
    );

    let relay = Relay::start(connector, config.slot.format, store, config.relay)
        .await
        .context("Failed to start relay")?;

    wait_for_shutdown(&relay).await?;
    relay.shutdown().await;

    Ok(())
}

/// Block until SIGINT or SIGTERM. SIGHUP restarts the replication stream.
#[cfg(unix)]
async fn wait_for_shutdown(relay: &Relay) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                info!("Received SIGINT");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = hangup.recv() => {
                if !relay.request_restart() {
                    info!("Received SIGHUP, restart already pending");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_relay: &Relay) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C");
    Ok(())
}

async fn cmd_setup(source: SourceArgs) -> Result<()> {
    let database_url = source.database_url()?;
    let (client, connection) = connect_postgres(&database_url)
        .await
        .context("Failed to connect to Postgres")?;

    ensure_slot(&client, &source.slot, true)
        .await
        .with_context(|| format!("Failed to set up replication slot '{}'", source.slot))?;

    drop(client);
    let _ = connection.await;

    println!("Replication slot '{}' is ready.", source.slot);
    Ok(())
}

async fn cmd_status(source: SourceArgs, lsn_file: &std::path::Path) -> Result<()> {
    let checkpoint = FileCheckpointStore::new(lsn_file)
        .load()
        .with_context(|| format!("Failed to read checkpoint from {}", lsn_file.display()))?;

    let database_url = source.database_url()?;
    let (client, connection) = connect_postgres(&database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let status = slot_status(&client, &source.slot).await?;
    drop(client);
    let _ = connection.await;

    let or_none = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());

    println!("\nCheckpoint:");
    println!("{:<22} {}", "File", lsn_file.display());
    println!("{:<22} {}", "LSN", or_none(checkpoint.map(|lsn| lsn.to_string())));

    println!("\nReplication slot:");
    match status {
        Some(status) => {
            println!("{:<22} {}", "Name", status.slot_name);
            println!("{:<22} {}", "Plugin", or_none(status.plugin));
            println!("{:<22} {}", "Active", status.active);
            println!(
                "{:<22} {}",
                "Restart LSN",
                or_none(status.restart_lsn.map(|lsn| lsn.to_string()))
            );
            println!(
                "{:<22} {}",
                "Confirmed flush LSN",
                or_none(status.confirmed_flush_lsn.map(|lsn| lsn.to_string()))
            );
        }
        None => {
            println!(
                "Slot '{}' does not exist. Run 'walcast setup' to create it.",
                source.slot
            );
        }
    }

    println!();
    Ok(())
}
