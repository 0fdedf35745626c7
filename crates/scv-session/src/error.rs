use crate::codec::CodecError;
use scv_core::CoreError;
use scv_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Malformed submission; the lease, if any, is left untouched.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("frame identical to the previous one")]
    DuplicateFrame,

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

impl SessionError {
    /// Failures caused by the request rather than by the server.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Core(_)
            | Self::InvalidPayload(_)
            | Self::DuplicateFrame
            | Self::TargetNotFound(_)
            | Self::Unauthorized(_) => true,
            Self::Store(err) => matches!(
                err,
                StoreError::InvalidName(_) | StoreError::InvalidAddress(_)
            ) || err.is_not_found(),
        }
    }
}
