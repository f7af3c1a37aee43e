//! Scoped ownership of temporary upload artifacts
//!
//! A [`TempArtifact`] is taken as soon as an event is picked up. Calling
//! [`TempArtifact::release`] deletes the file and reports what happened; if
//! the guard is dropped without being released (an unwinding task, an early
//! return) the file is deleted from `Drop` instead. Either way the delete is
//! attempted exactly once.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What happened when an artifact was removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum Deletion {
    Deleted,
    /// Nothing to delete; the file was already gone
    AlreadyAbsent,
    Failed(String),
}

/// Guard that deletes the file at `path` when released or dropped
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    released: bool,
}

impl TempArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the artifact now
    pub async fn release(mut self) -> Deletion {
        self.released = true;
        let result = tokio::fs::remove_file(&self.path).await;
        record_deletion(&self.path, result)
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(path = %self.path.display(), "Artifact dropped without release, deleting");
        record_deletion(&self.path, std::fs::remove_file(&self.path));
    }
}

fn record_deletion(path: &Path, result: std::io::Result<()>) -> Deletion {
    match result {
        Ok(()) => {
            info!(path = %path.display(), "Temp file deleted");
            Deletion::Deleted
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Temp file already absent");
            Deletion::AlreadyAbsent
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not delete temp file");
            Deletion::Failed(e.to_string())
        },
    }
}
