//! Chunk geometry, chunk reading and integrity helpers shared by the
//! chunkline server and client.

mod chunked;
mod layout;
mod progress;
mod validation;

pub use chunked::{ChunkReader, calculate_file_checksum, checksum_bytes, verify_checksum};
pub use layout::{ChunkLayout, ChunkSpan};
pub use progress::SpeedCalculator;
pub use validation::validate_file_name;

/// Default chunk size: 4 MiB.
///
/// Larger chunks reduce per-chunk overhead (SHA-256, acks, syscalls) at the
/// cost of more bytes lost per failed attempt.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("invalid chunk layout: {0}")]
    InvalidLayout(String),

    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },
}
