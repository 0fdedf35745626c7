use crate::jsonl::JsonlError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Jsonl(#[from] JsonlError),

    #[error("{path}: {message}")]
    Io { path: String, message: String },

    #[error("record already exists: {0}")]
    RecordExists(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// A versioned slot may be written once.
    #[error("slot already written: {0}")]
    SlotExists(String),

    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("invalid blob address: {0:?}")]
    InvalidAddress(String),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Whether the error is the caller asking for something that does not
    /// exist, as opposed to the store failing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound(_) | Self::BlobNotFound(_))
    }
}
