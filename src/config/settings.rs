use super::{default_state_root, ConfigError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    pub workflows_dir: PathBuf,
    /// Defaults to `~/.flowrelay`.
    #[serde(default)]
    pub state_root: Option<PathBuf>,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub sessions: SessionSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub access: AccessSettings,
    /// Chat that receives a copy of every completed form and its outputs.
    #[serde(default)]
    pub monitor_chat_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_executor_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_executor_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            program: default_executor_program(),
            args: Vec::new(),
            timeout_secs: default_executor_timeout_secs(),
        }
    }
}

impl ExecutorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl SessionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProgressSettings {
    #[serde(default = "default_progress_every")]
    pub every: u32,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            every: default_progress_every(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessSettings {
    #[serde(default)]
    pub allowed_chat_ids: Vec<String>,
    #[serde(default)]
    pub allowed_user_ids: Vec<String>,
}

fn default_executor_program() -> String {
    "python3".to_string()
}

fn default_executor_timeout_secs() -> u64 {
    600
}

fn default_session_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_progress_every() -> u32 {
    crate::queue::DEFAULT_PROGRESS_EVERY
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflows_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "workflows_dir",
                reason: "must be non-empty",
            });
        }
        if let Some(root) = &self.state_root {
            if !root.is_absolute() {
                return Err(ConfigError::Invalid {
                    field: "state_root",
                    reason: "must be an absolute path",
                });
            }
        }
        if self.executor.program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "executor.program",
                reason: "must be non-empty",
            });
        }
        if self.executor.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "executor.timeout_secs",
                reason: "must be greater than zero",
            });
        }
        if self.sessions.ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sessions.ttl_secs",
                reason: "must be greater than zero",
            });
        }
        if self.sessions.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "sessions.sweep_interval_ms",
                reason: "must be greater than zero",
            });
        }
        if self.progress.every == 0 {
            return Err(ConfigError::Invalid {
                field: "progress.every",
                reason: "must be greater than zero",
            });
        }
        if self
            .monitor_chat_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "monitor_chat_id",
                reason: "must be non-empty when set",
            });
        }
        for id in self
            .access
            .allowed_chat_ids
            .iter()
            .chain(&self.access.allowed_user_ids)
        {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "access",
                    reason: "ids must be non-empty",
                });
            }
        }
        Ok(())
    }

    pub fn resolve_state_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_root {
            Some(root) => Ok(root.clone()),
            None => default_state_root(),
        }
    }

    /// Relative `workflows_dir` values resolve against `base`, normally the
    /// directory holding the settings file.
    pub fn resolve_workflows_dir(&self, base: &Path) -> PathBuf {
        if self.workflows_dir.is_absolute() {
            self.workflows_dir.clone()
        } else {
            base.join(&self.workflows_dir)
        }
    }
}
