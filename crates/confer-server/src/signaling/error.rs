use crate::engine::EngineError;
use confer_protocol::{ErrorKind, ErrorReply};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ProtocolViolation(String),
}

impl SignalingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalingError::Validation(_) => ErrorKind::Validation,
            SignalingError::Engine(_) => ErrorKind::Engine,
            SignalingError::NotFound(_) => ErrorKind::NotFound,
            SignalingError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
        }
    }

    pub fn to_reply(&self) -> ErrorReply {
        ErrorReply {
            error: self.to_string(),
            kind: self.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_engine_errors_keep_their_message() {
        let id = Uuid::new_v4();
        let err: SignalingError = EngineError::AlreadyConnected(id).into();

        let reply = err.to_reply();
        assert_eq!(reply.kind, ErrorKind::Engine);
        assert_eq!(reply.error, format!("transport {} is already connected", id));
    }
}
