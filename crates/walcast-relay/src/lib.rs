//! Fan-out of Postgres logical replication changes to WebSocket clients.

mod config;
mod consumer;
mod error;
pub mod mock;
mod registry;
mod relay;
mod server;
mod supervisor;

pub use config::RelayConfig;
pub use consumer::{Consumer, ConsumerExit, EventSink};
pub use error::{RelayError, RelayResult};
pub use registry::{ClientRegistry, ConnectionId, Outbound};
pub use relay::Relay;
pub use server::{drain, WsServer};
pub use supervisor::{Supervisor, SupervisorHandle};
