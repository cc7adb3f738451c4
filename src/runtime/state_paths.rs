use super::RuntimeError;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.error_log_dir(),
            self.outbox_dir(),
            self.scratch_dir(),
        ]
    }

    pub fn error_log_dir(&self) -> PathBuf {
        self.root.join("logs/errors")
    }

    /// Images delivered by the local console transport.
    pub fn outbox_dir(&self) -> PathBuf {
        self.root.join("outbox")
    }

    /// Per-job input files handed to the workflow engine.
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| RuntimeError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
