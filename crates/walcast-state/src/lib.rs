mod error;
mod file;
mod memory;

pub use error::{StateError, StateResult};
pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use walcast_core::Lsn;

/// Durable storage for the last handled stream position.
pub trait CheckpointStore: Send + Sync {
    /// Load the saved checkpoint. `None` means start from the slot's default.
    fn load(&self) -> StateResult<Option<Lsn>>;

    /// Persist a checkpoint. Returns only once the value is stored or the
    /// write has failed.
    fn save(&self, lsn: Lsn) -> StateResult<()>;
}
