//! Replication lifecycle states and restart backoff.

use std::fmt;
use std::time::Duration;

/// Lifecycle of the upstream subscription.
///
/// At most one consumer is ever `Streaming`; all state changes go through
/// [`ReplicationState::can_transition_to`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    #[default]
    Stopped,
    Starting,
    Streaming,
    Restarting,
    ShuttingDown,
}

impl ReplicationState {
    pub fn can_transition_to(self, next: ReplicationState) -> bool {
        use ReplicationState::*;

        match (self, next) {
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Stopped, Starting) => true,
            (Starting, Streaming) | (Starting, Restarting) => true,
            (Streaming, Restarting) => true,
            (Restarting, Starting) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReplicationState::Stopped => "stopped",
            ReplicationState::Starting => "starting",
            ReplicationState::Streaming => "streaming",
            ReplicationState::Restarting => "restarting",
            ReplicationState::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential restart delay: doubles per consecutive failure up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// `min` is clamped to at least one millisecond and `max` to at least `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// The delay the next call to [`Backoff::next_delay`] will return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReplicationState::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Streaming));
        assert!(Starting.can_transition_to(Restarting));
        assert!(Streaming.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Starting));

        for state in [Stopped, Starting, Streaming, Restarting] {
            assert!(state.can_transition_to(ShuttingDown));
        }
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!Stopped.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Starting));
        assert!(!Restarting.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Streaming));
        assert!(!ShuttingDown.can_transition_to(Starting));
        assert!(!ShuttingDown.can_transition_to(ShuttingDown));
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.peek(), Duration::from_millis(400));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_clamps_bounds() {
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.min(), Duration::from_millis(1));
        assert_eq!(backoff.max(), Duration::from_millis(1));

        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.max(), Duration::from_secs(5));
    }
}
