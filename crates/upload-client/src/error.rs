//! Client error types.

use chunkline_protocol::{ErrorBody, ErrorKind};
use chunkline_transfer::TransferError;
use tokio_tungstenite::tungstenite;

use crate::retry::FailureClass;
use crate::types::TaskStatus;

/// Errors produced by the upload client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// The server answered with a classified error.
    #[error("server error {kind}: {message}")]
    Remote {
        kind: ErrorKind,
        message: String,
        missing: Vec<u32>,
    },

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("unknown upload task: {0}")]
    UnknownTask(String),

    #[error("task {file_id} is {status}")]
    InvalidState { file_id: String, status: TaskStatus },

    #[error("server session has {server} chunks, local layout has {local}")]
    LayoutMismatch { local: u32, server: u32 },

    #[error("chunks {failed:?} failed after exhausting retries: {last_error}")]
    RetriesExhausted { failed: Vec<u32>, last_error: String },
}

impl ClientError {
    /// Wraps an error body received from the server.
    pub fn from_body(body: ErrorBody) -> Self {
        ClientError::Remote {
            kind: body.kind,
            message: body.message,
            missing: body.missing_chunks,
        }
    }

    /// Wire classification of the failure, if it has one.
    ///
    /// Connection-level failures count as [`ErrorKind::Transient`].
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Remote { kind, .. } => Some(*kind),
            ClientError::Ws(_) | ClientError::Timeout | ClientError::Closed => {
                Some(ErrorKind::Transient)
            }
            ClientError::LayoutMismatch { .. } => Some(ErrorKind::InvalidArgument),
            _ => None,
        }
    }

    /// Backoff class for failures worth retrying; `None` means terminal.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self.kind()? {
            ErrorKind::RateLimited => Some(FailureClass::RateLimited),
            ErrorKind::Transient => Some(FailureClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_class().is_some()
    }

    /// Missing chunk indices reported with an `IncompleteUpload` error.
    pub fn missing_chunks(&self) -> Option<&[u32]> {
        match self {
            ClientError::Remote {
                kind: ErrorKind::IncompleteUpload,
                missing,
                ..
            } => Some(missing),
            _ => None,
        }
    }

    /// A message telling the user what went wrong and what to do next.
    pub fn actionable_reason(&self) -> String {
        let ClientError::Remote { kind, message, .. } = self else {
            return self.to_string();
        };
        match kind {
            ErrorKind::NotFound => format!(
                "the upload session no longer exists on the server (expired or cancelled); start a new upload ({message})"
            ),
            ErrorKind::Forbidden => format!(
                "the server refused access to this upload; check the access token ({message})"
            ),
            ErrorKind::PayloadTooLarge => format!(
                "chunks are larger than the server accepts; retry with a smaller chunk size ({message})"
            ),
            ErrorKind::SizeMismatch => format!(
                "the assembled file does not match the declared size; the source may have changed during upload ({message})"
            ),
            ErrorKind::AlreadyCompleting => format!(
                "the upload is being assembled by another request; check its status later ({message})"
            ),
            ErrorKind::InvalidArgument => format!("the server rejected the upload: {message}"),
            _ => self.to_string(),
        }
    }
}
