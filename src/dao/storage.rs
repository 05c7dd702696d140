use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by room store backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The targeted room document does not exist.
    #[error("room `{room_id}` not found")]
    NotFound { room_id: String },
    /// A conditional write was rejected because its precondition no longer holds.
    #[error("precondition failed on room `{room_id}`: {reason}")]
    PreconditionFailed {
        room_id: String,
        reason: &'static str,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Whether the error is a rejected precondition rather than a transport failure.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, StorageError::PreconditionFailed { .. })
    }
}
