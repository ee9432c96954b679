use std::time::Duration;

use walcast_core::{AuthPolicy, Backoff};

use crate::error::{RelayError, RelayResult};

/// Settings for the relay process, independent of the upstream source.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket server binds to, e.g. `0.0.0.0:4000`.
    pub listen_addr: String,
    /// Shared secret clients must present. Blank means none.
    pub auth_token: Option<String>,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Concurrent socket limit; extra sockets are dropped at accept.
    pub max_connections: usize,
    /// Outbound queue depth per client.
    pub client_buffer: usize,
    /// Upper bound for upstream teardown and client drain on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4000".to_string(),
            auth_token: None,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_connections: 1024,
            client_buffer: 1024,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> RelayResult<()> {
        if self.min_backoff.is_zero() {
            return Err(RelayError::Config("min backoff must be non-zero".into()));
        }
        if self.min_backoff > self.max_backoff {
            return Err(RelayError::Config(format!(
                "min backoff ({:?}) exceeds max backoff ({:?})",
                self.min_backoff, self.max_backoff
            )));
        }
        if self.max_connections == 0 {
            return Err(RelayError::Config("max connections must be at least 1".into()));
        }
        if self.client_buffer == 0 {
            return Err(RelayError::Config("client buffer must be at least 1".into()));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.min_backoff, self.max_backoff)
    }

    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy::new(self.auth_token.clone())
    }
}
