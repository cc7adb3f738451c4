use crate::channels::transport::TransportError;
use crate::registry::PortType;
use crate::shared::ids::UserId;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("user {invoker} already has a job queued or executing")]
    DuplicateInFlight { invoker: UserId },
    #[error("job queue is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("argument --{argument} is required")]
    MissingRequiredArgument { argument: String },
    #[error("workflow has no input port `{argument}`")]
    UnknownPort { argument: String },
    #[error("argument --{argument} expects {expected}, got {found}")]
    TypeMismatch {
        argument: String,
        expected: PortType,
        found: PortType,
    },
    #[error("text output must not be empty")]
    EmptyTextOutput,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("workflow engine failed: {0}")]
    Engine(String),
    #[error("workflow engine timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("workflow execution panicked: {0}")]
    Panicked(String),
    #[error("engine io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutionError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}
