use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use walcast_core::{ChangeBatch, ChangeSource, Error, Lsn, Result, SourceConnector};

/// Something a [`MockSource`] hands to the consumer.
#[derive(Debug, Clone)]
pub enum MockEvent {
    Batch(ChangeBatch),
    /// Fail the current subscription with this message.
    Fail(String),
    /// End the current subscription's stream.
    End,
}

/// An in-memory upstream for testing.
///
/// Events pushed into the connector are delivered to whichever subscription
/// is currently reading. Connects, acknowledgments and closes are recorded.
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    events_tx: mpsc::UnboundedSender<MockEvent>,
    events_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockEvent>>>,
    connected: Arc<Notify>,
}

#[derive(Default)]
struct MockState {
    /// Start positions requested by each connect, in order.
    connects: Vec<Option<Lsn>>,
    acks: Vec<Lsn>,
    closes: usize,
    /// Subscriptions connected and not yet closed.
    active: usize,
    max_active: usize,
    /// Errors returned by upcoming connect calls.
    connect_failures: VecDeque<String>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            events_tx,
            events_rx: Arc::new(tokio::sync::Mutex::new(events_rx)),
            connected: Arc::new(Notify::new()),
        }
    }

    /// Queue an event for the active subscription.
    pub fn push(&self, event: MockEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Queue a batch for the active subscription.
    pub fn push_batch(&self, lsn: Lsn, data: impl Into<String>) {
        self.push(MockEvent::Batch(ChangeBatch::new(lsn, data)));
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_connects(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state
                .connect_failures
                .push_back("mock connect failure".to_string());
        }
    }

    pub fn connects(&self) -> Vec<Option<Lsn>> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn acks(&self) -> Vec<Lsn> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    /// Most subscriptions that were ever open at the same time.
    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    /// Wait until at least `count` connect attempts have been made.
    pub async fn wait_for_connects(&self, count: usize) {
        loop {
            let notified = self.connected.notified();
            if self.connects().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl SourceConnector for MockConnector {
    type Source = MockSource;

    async fn connect(&self, start: Option<Lsn>) -> Result<MockSource> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.connects.push(start);
            match state.connect_failures.pop_front() {
                Some(message) => Err(Error::Source(message)),
                None => {
                    state.active += 1;
                    state.max_active = state.max_active.max(state.active);
                    Ok(())
                }
            }
        };
        self.connected.notify_waiters();

        outcome.map(|()| MockSource {
            state: self.state.clone(),
            events: self.events_rx.clone(),
            closed: false,
        })
    }
}

/// One subscription opened by [`MockConnector`].
pub struct MockSource {
    state: Arc<Mutex<MockState>>,
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockEvent>>>,
    closed: bool,
}

impl ChangeSource for MockSource {
    async fn next_batch(&mut self) -> Result<Option<ChangeBatch>> {
        if self.closed {
            return Err(Error::SourceClosed);
        }

        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(MockEvent::Batch(batch)) => Ok(Some(batch)),
            Some(MockEvent::Fail(message)) => Err(Error::Source(message)),
            Some(MockEvent::End) | None => Ok(None),
        }
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
        if self.closed {
            return Err(Error::SourceClosed);
        }
        self.state.lock().unwrap().acks.push(lsn);
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.active -= 1;
    }
}
