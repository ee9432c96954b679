use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use walcast_core::Lsn;

use crate::error::{StateError, StateResult};
use crate::CheckpointStore;

/// In-memory checkpoint store, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    lsn: Mutex<Option<Lsn>>,
    history: Mutex<Vec<Lsn>>,
    fail_saves: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a checkpoint.
    pub fn with_checkpoint(lsn: Lsn) -> Self {
        let store = Self::default();
        if let Ok(mut slot) = store.lsn.lock() {
            *slot = Some(lsn);
        }
        store
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Every successfully saved checkpoint, in order.
    pub fn history(&self) -> Vec<Lsn> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> StateResult<Option<Lsn>> {
        let lsn = self.lsn.lock().map_err(|_| StateError::Poisoned)?;
        Ok(*lsn)
    }

    fn save(&self, lsn: Lsn) -> StateResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StateError::Rejected("saves disabled".to_string()));
        }

        *self.lsn.lock().map_err(|_| StateError::Poisoned)? = Some(lsn);
        self.history
            .lock()
            .map_err(|_| StateError::Poisoned)?
            .push(lsn);
        Ok(())
    }
}
