mod connect;
mod error;
pub mod slot;
pub mod source;

pub use connect::connect_postgres;
pub use error::{PgError, PgResult};
pub use slot::{ensure_slot, slot_status, SlotStatus, OUTPUT_PLUGIN};
pub use source::{SlotConfig, Wal2JsonConnector, Wal2JsonSource};
