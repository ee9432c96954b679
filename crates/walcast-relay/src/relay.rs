use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use walcast_core::{DecodeFormat, SourceConnector};
use walcast_state::CheckpointStore;

use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::registry::ClientRegistry;
use crate::server::{drain, WsServer};
use crate::supervisor::{Supervisor, SupervisorHandle};

/// A running relay: the WebSocket server plus the replication supervisor.
pub struct Relay {
    registry: ClientRegistry,
    supervisor: SupervisorHandle,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_shutdown_tx: watch::Sender<bool>,
    supervisor_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
    grace: Duration,
}

impl Relay {
    /// Bind the server and start replicating from `connector`.
    pub async fn start<C>(
        connector: C,
        format: DecodeFormat,
        checkpoints: Arc<dyn CheckpointStore>,
        config: RelayConfig,
    ) -> RelayResult<Self>
    where
        C: SourceConnector,
    {
        config.validate()?;

        let registry = ClientRegistry::new(config.auth_policy(), config.client_buffer);
        let server = WsServer::bind(&config.listen_addr, registry.clone(), config.max_connections).await?;
        let local_addr = server.local_addr();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor::new(connector, format, checkpoints, registry.clone(), &config);
        let handle = supervisor.handle();
        let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));
        let server_task = server.serve(server_shutdown_rx);

        info!(
            addr = %local_addr,
            format = %format,
            auth_required = registry.policy().requires_auth(),
            "Relay started"
        );

        Ok(Self {
            registry,
            supervisor: handle,
            local_addr,
            shutdown_tx,
            server_shutdown_tx,
            supervisor_task,
            server_task,
            grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn request_restart(&self) -> bool {
        self.supervisor.request_restart()
    }

    /// Stop replication and wait for the upstream teardown, then stop
    /// accepting and close every client. Each wait is bounded by the grace
    /// period.
    pub async fn shutdown(mut self) {
        info!("Shutting down relay");
        self.shutdown_tx.send_replace(true);

        match tokio::time::timeout(self.grace, &mut self.supervisor_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Replication supervisor task failed"),
            Err(_) => {
                warn!(grace = ?self.grace, "Replication supervisor did not stop in time");
                self.supervisor_task.abort();
            }
        }

        self.server_shutdown_tx.send_replace(true);
        if let Err(e) = self.server_task.await {
            warn!(error = %e, "WebSocket server task failed");
        }

        drain(&self.registry, self.grace).await;
        info!("Relay stopped");
    }
}
