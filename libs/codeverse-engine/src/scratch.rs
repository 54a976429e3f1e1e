// Per-execution scratch directories
// Each execution stages its files under scratch_root/<execution id>; nothing is shared.

use crate::error::EngineError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Scratch directory owned by one execution.
///
/// `cleanup` must be called on every exit path. If the owning future is
/// dropped first (caller gave up), `Drop` removes the directory synchronously.
#[derive(Debug)]
pub struct ScratchDir {
    execution_id: Uuid,
    path: PathBuf,
    removed: bool,
}

impl ScratchDir {
    pub async fn create(root: &Path) -> Result<Self, EngineError> {
        let execution_id = Uuid::new_v4();
        let path = root.join(execution_id.to_string());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(EngineError::Scratch)?;
        debug!(execution_id = %execution_id, path = %path.display(), "Scratch directory created");
        Ok(Self {
            execution_id,
            path,
            removed: false,
        })
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file verbatim into the directory
    pub async fn write(&self, filename: &str, contents: &str) -> Result<PathBuf, EngineError> {
        let file = self.path.join(filename);
        tokio::fs::write(&file, contents)
            .await
            .map_err(EngineError::Scratch)?;
        Ok(file)
    }

    /// Remove the directory and everything staged in it.
    /// Failures are logged and never affect the execution result.
    pub async fn cleanup(mut self) {
        self.removed = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn!(
                execution_id = %self.execution_id,
                path = %self.path.display(),
                error = %e,
                "Cleanup warning: failed to remove scratch directory"
            );
        } else {
            debug!(execution_id = %self.execution_id, "Scratch directory removed");
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Cleanup warning: scratch directory left behind");
            }
        }
    }
}
