use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::EstimationError;
use crate::optimizer::OptimizerState;

/// Durable store for optimizer state, one blob per run.
///
/// `save` overwrites: later saves supersede earlier ones for the same run.
/// The state is serialized to JSON, written to a temporary sibling and
/// renamed into place, so an interrupted save never corrupts the previous
/// checkpoint.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the full optimizer state.
    pub fn save(&self, state: &OptimizerState) -> Result<(), EstimationError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| self.error(e))?;
            }
        }
        let json = serde_json::to_string_pretty(state).map_err(|e| self.error(e))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| self.error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.error(e))?;
        Ok(())
    }

    /// Load the most recently saved state, or `None` if no checkpoint
    /// exists yet. A checkpoint that exists but cannot be read is an
    /// error: resuming over it would silently lose progress.
    pub fn load(&self) -> Result<Option<OptimizerState>, EstimationError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.error(e)),
        };
        let state = serde_json::from_str(&text).map_err(|e| self.error(e))?;
        Ok(Some(state))
    }

    /// Remove the stored checkpoint, if any.
    pub fn clear(&self) -> Result<(), EstimationError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(e)),
        }
    }

    fn error(&self, reason: impl ToString) -> EstimationError {
        EstimationError::Checkpoint {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}
