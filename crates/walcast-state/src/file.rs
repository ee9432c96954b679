use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walcast_core::Lsn;

use crate::error::{StateError, StateResult};
use crate::CheckpointStore;

/// Checkpoint stored as the textual LSN in a single file.
///
/// Writes go to a sibling temporary file which is fsynced and renamed over
/// the target, so a crash leaves either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!(path = %path.display(), "Using checkpoint file");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> StateResult<Option<Lsn>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }

        let lsn = Lsn::parse(content).map_err(|e| StateError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        debug!(lsn = %lsn, "Loaded checkpoint");
        Ok(Some(lsn))
    }

    fn save(&self, lsn: Lsn) -> StateResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(lsn.to_string().as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        Ok(())
    }
}
