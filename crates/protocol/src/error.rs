//! Error taxonomy shared by server and client.

use serde::{Deserialize, Serialize};

/// Classification of every failure the upload protocol can report.
///
/// The numeric codes follow HTTP semantics so transports that map onto
/// HTTP status codes can reuse them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request or out-of-range value. Never retried.
    InvalidArgument,
    /// Caller does not own the session. Never retried.
    Forbidden,
    /// Session absent, cancelled or expired. Never retried.
    NotFound,
    /// Another assembly for the session is running.
    AlreadyCompleting,
    /// Chunk payload exceeds the server's limit.
    PayloadTooLarge,
    /// `complete` was called before every chunk arrived.
    IncompleteUpload,
    /// Assembled artifact size differs from the declared size.
    SizeMismatch,
    /// Server is shedding load; retry after a longer backoff.
    RateLimited,
    /// Network or server-side I/O failure; retry with backoff.
    Transient,
}

impl ErrorKind {
    /// Returns the numeric wire code.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyCompleting => 409,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::IncompleteUpload => 422,
            ErrorKind::SizeMismatch => 424,
            ErrorKind::RateLimited => 429,
            ErrorKind::Transient => 503,
        }
    }

    /// Maps a wire code back to a kind.
    ///
    /// Unknown 5xx codes are treated as transient; anything else unknown
    /// is an invalid argument so the client does not loop on it.
    pub fn from_code(code: i32) -> Self {
        match code {
            403 | 401 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::AlreadyCompleting,
            413 => ErrorKind::PayloadTooLarge,
            422 => ErrorKind::IncompleteUpload,
            424 => ErrorKind::SizeMismatch,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Transient,
            _ => ErrorKind::InvalidArgument,
        }
    }

    /// Returns `true` if retrying the same request may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Transient)
    }

    /// Stable lowercase name, as used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyCompleting => "already_completing",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::IncompleteUpload => "incomplete_upload",
            ErrorKind::SizeMismatch => "size_mismatch",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorKind; 9] = [
        ErrorKind::InvalidArgument,
        ErrorKind::Forbidden,
        ErrorKind::NotFound,
        ErrorKind::AlreadyCompleting,
        ErrorKind::PayloadTooLarge,
        ErrorKind::IncompleteUpload,
        ErrorKind::SizeMismatch,
        ErrorKind::RateLimited,
        ErrorKind::Transient,
    ];

    #[test]
    fn codes_map_back_to_kinds() {
        for kind in ALL {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn only_load_and_network_errors_retry() {
        let retryable: Vec<_> = ALL.into_iter().filter(|k| k.is_retryable()).collect();
        assert_eq!(retryable, vec![ErrorKind::RateLimited, ErrorKind::Transient]);
    }

    #[test]
    fn unknown_codes() {
        assert_eq!(ErrorKind::from_code(500), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_code(502), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_code(418), ErrorKind::InvalidArgument);
        assert_eq!(ErrorKind::from_code(401), ErrorKind::Forbidden);
    }

    #[test]
    fn serde_name_matches_as_str() {
        for kind in ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
