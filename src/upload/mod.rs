//! Upload module
//!
//! The resumable upload engine: session lifecycle, offset-verified chunk
//! ingestion and finalization into a completed artifact.

use crate::store::StoreError;
use thiserror::Error;

pub mod chunk_writer;
pub mod hook;
pub mod session;

pub use chunk_writer::{ChunkWriteError, ChunkWriter};
pub use hook::{CompletionHook, CopyToDirectoryHook, HookError};
pub use session::{SessionManager, SessionStatus};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Declared or received size is above what the server accepts
    #[error("Upload exceeds maximum size of {max} bytes")]
    SizeLimitExceeded { max: u64 },

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload expired: {0}")]
    Expired(String),

    #[error("Offset conflict: client sent {expected}, server has {current}")]
    OffsetConflict { expected: u64, current: u64 },

    /// The request body ended early or failed; nothing was committed
    #[error("Payload interrupted: {0}")]
    PayloadInterrupted(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    /// The completion hook failed; the upload is complete and its bytes are kept
    #[error("Finalization of {id} failed at offset {offset}: {reason}")]
    FinalizationError {
        id: String,
        offset: u64,
        reason: String,
    },
}

impl UploadError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::InvalidArgument(_) => "invalid_argument",
            UploadError::SizeLimitExceeded { .. } => "size_limit",
            UploadError::NotFound(_) => "not_found",
            UploadError::Expired(_) => "expired",
            UploadError::OffsetConflict { .. } => "offset_conflict",
            UploadError::PayloadInterrupted(_) => "payload_interrupted",
            UploadError::StorageError(_) => "storage",
            UploadError::FinalizationError { .. } => "finalization",
        }
    }
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => UploadError::NotFound(id),
            other => UploadError::StorageError(other.to_string()),
        }
    }
}
