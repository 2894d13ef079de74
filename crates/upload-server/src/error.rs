//! Upload server error types.

use chunkline_protocol::{ErrorBody, ErrorKind};

/// Failures of the staging, blob storage and artifact sink collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

/// Errors produced by session store, assembler and service operations.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("upload {0} belongs to another caller")]
    Forbidden(String),

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload {0} is being assembled")]
    AlreadyCompleting(String),

    #[error("chunk of {size} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("upload incomplete, missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    #[error("assembled {actual} bytes, declared {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("too many concurrent chunk writes")]
    RateLimited,

    #[error("corrupt chunk: {0}")]
    CorruptChunk(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl UploadError {
    /// Classifies the error for the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            UploadError::Forbidden(_) => ErrorKind::Forbidden,
            UploadError::NotFound(_) => ErrorKind::NotFound,
            UploadError::AlreadyCompleting(_) => ErrorKind::AlreadyCompleting,
            UploadError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            UploadError::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            UploadError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            UploadError::RateLimited => ErrorKind::RateLimited,
            UploadError::CorruptChunk(_) | UploadError::Storage(_) => ErrorKind::Transient,
        }
    }

    /// Builds the error body sent to clients.
    ///
    /// Storage details stay in the server log.
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            UploadError::IncompleteUpload { missing } => {
                ErrorBody::new(self.kind(), self.to_string()).with_missing(missing.clone())
            }
            UploadError::Storage(_) => {
                ErrorBody::new(self.kind(), "temporary storage failure, retry later")
            }
            _ => ErrorBody::new(self.kind(), self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_are_transient() {
        let err = UploadError::from(StorageError::Io(std::io::Error::other("disk full")));
        assert_eq!(err.kind(), ErrorKind::Transient);
        let body = err.to_error_body();
        assert_eq!(body.code, 503);
        assert!(!body.message.contains("disk full"));
    }

    #[test]
    fn incomplete_carries_missing() {
        let err = UploadError::IncompleteUpload {
            missing: vec![2, 4],
        };
        let body = err.to_error_body();
        assert_eq!(body.kind, ErrorKind::IncompleteUpload);
        assert_eq!(body.missing_chunks, vec![2, 4]);
    }

    #[test]
    fn corrupt_chunk_is_retryable() {
        assert!(UploadError::CorruptChunk("bad".into()).kind().is_retryable());
        assert!(!UploadError::Forbidden("u".into()).kind().is_retryable());
    }
}
