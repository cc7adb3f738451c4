use crate::registry::PortType;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown command `/{command}`")]
    UnknownCommand { command: String },
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },
    #[error("session {session_id} belongs to another user")]
    NotOwner { session_id: String },
    #[error("argument --{argument} expects {expected}, got {found}")]
    TypeMismatch {
        argument: String,
        expected: PortType,
        found: PortType,
    },
    #[error("failed to generate session id: {reason}")]
    IdGeneration { reason: String },
}
