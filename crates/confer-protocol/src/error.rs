use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown media kind: {0}")]
    UnknownMediaKind(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}
