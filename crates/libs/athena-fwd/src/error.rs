use ccnx_codec::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AthenaError {
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("capacity exceeded: {0}")]
    Capacity(String),
    #[error("expired")]
    Expired,
    #[error("framing error: {0:?}")]
    Framing(CodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("would block")]
    WouldBlock,
}

impl From<CodecError> for AthenaError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::BadName => AthenaError::Invalid("bad name".into()),
            other => AthenaError::Framing(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, AthenaError>;
