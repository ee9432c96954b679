//! Reconnection supervisor.
//!
//! Drives the replication lifecycle: open a consumer, stream until it fails
//! or a restart is requested, tear it down completely, back off, and start
//! again. At most one consumer exists at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{info, warn};
use walcast_core::{Backoff, DecodeFormat, ReplicationState, SourceConnector};
use walcast_state::CheckpointStore;

use crate::config::RelayConfig;
use crate::consumer::{Consumer, ConsumerExit, EventSink};

/// Resolves once shutdown has been requested or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Collapses concurrent restart requests into one in-flight restart.
#[derive(Default)]
struct RestartGate {
    in_flight: AtomicBool,
    notify: Notify,
}

impl RestartGate {
    /// Returns `false` if a restart was already pending.
    fn trigger(&self) -> bool {
        let claimed = self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if claimed {
            self.notify.notify_waiters();
        }
        claimed
    }

    async fn triggered(&self) {
        loop {
            let notified = self.notify.notified();
            if self.in_flight.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn complete(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    state: watch::Sender<ReplicationState>,
    gate: RestartGate,
}

impl Shared {
    fn state(&self) -> ReplicationState {
        *self.state.borrow()
    }

    fn transition(&self, next: ReplicationState) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Rejected replication state transition");
            return false;
        }
        self.state.send_replace(next);
        info!(from = %current, to = %next, "Replication state changed");
        true
    }
}

/// Observes and nudges a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Arc<Shared>,
}

impl SupervisorHandle {
    pub fn state(&self) -> ReplicationState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReplicationState> {
        self.shared.state.subscribe()
    }

    /// Ask for the current subscription to be torn down and reopened.
    ///
    /// Returns `true` if this call started a restart, `false` if one was
    /// already pending or shutdown has begun.
    pub fn request_restart(&self) -> bool {
        if self.shared.state() == ReplicationState::ShuttingDown {
            return false;
        }
        let started = self.shared.gate.trigger();
        if started {
            info!("Replication restart requested");
        }
        started
    }
}

pub struct Supervisor<C, K> {
    connector: C,
    format: DecodeFormat,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: K,
    backoff: Backoff,
    grace: Duration,
    shared: Arc<Shared>,
}

impl<C, K> Supervisor<C, K>
where
    C: SourceConnector,
    K: EventSink + Clone + 'static,
{
    pub fn new(
        connector: C,
        format: DecodeFormat,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: K,
        config: &RelayConfig,
    ) -> Self {
        let (state, _) = watch::channel(ReplicationState::Stopped);
        Self {
            connector,
            format,
            checkpoints,
            sink,
            backoff: config.backoff(),
            grace: config.shutdown_grace,
            shared: Arc::new(Shared {
                state,
                gate: RestartGate::default(),
            }),
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the lifecycle until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.shared.transition(ReplicationState::Starting);

        loop {
            if !self.start(&mut shutdown).await {
                break;
            }
            if !self.restart_delay(&mut shutdown).await {
                break;
            }
            self.shared.gate.complete();
            self.shared.transition(ReplicationState::Starting);
        }

        info!("Replication supervisor stopped");
    }

    /// One `Starting` attempt, streaming on success, and full teardown.
    ///
    /// Returns `false` once shutdown has been handled.
    async fn start(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let opened = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => None,
            opened = Consumer::open(
                &self.connector,
                self.format.decoder(),
                self.checkpoints.clone(),
                self.sink.clone(),
            ) => Some(opened),
        };

        let mut consumer = match opened {
            None => {
                self.shared.transition(ReplicationState::ShuttingDown);
                return false;
            }
            Some(Ok(consumer)) => consumer,
            Some(Err(e)) => {
                warn!(error = %e, "Failed to open replication stream");
                self.shared.gate.trigger();
                self.shared.transition(ReplicationState::Restarting);
                return true;
            }
        };

        self.shared.transition(ReplicationState::Streaming);
        self.backoff.reset();

        let shared = self.shared.clone();
        let mut stop_rx = shutdown.clone();
        let exit = consumer
            .run(async {
                tokio::select! {
                    _ = shutdown_requested(&mut stop_rx) => {}
                    _ = shared.gate.triggered() => {}
                }
            })
            .await;
        let stopping = *shutdown.borrow();

        match exit {
            Ok(ConsumerExit::Stopped) if stopping => {
                self.shared.transition(ReplicationState::ShuttingDown);
                if tokio::time::timeout(self.grace, consumer.close()).await.is_err() {
                    warn!(grace = ?self.grace, "Upstream teardown exceeded shutdown grace period");
                }
                return false;
            }
            Ok(ConsumerExit::Stopped) => {}
            Ok(ConsumerExit::StreamEnded) => {
                warn!("Replication stream ended");
                self.shared.gate.trigger();
            }
            Err(e) => {
                warn!(error = %e, "Replication stream failed");
                self.shared.gate.trigger();
            }
        }

        self.shared.transition(ReplicationState::Restarting);
        consumer.close().await;
        true
    }

    /// Wait out the backoff delay. Returns `false` if shutdown came first.
    async fn restart_delay(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "Restarting replication after backoff");

        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => {
                self.shared.transition(ReplicationState::ShuttingDown);
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
