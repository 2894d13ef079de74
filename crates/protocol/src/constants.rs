use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version announced in the `hello` handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Time allowed to write a WebSocket message.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Read deadline: if nothing arrives within this window (no pong, no
/// response, no request) the connection is considered dead.
///
/// Large enough to tolerate slow staging writes on the server while a
/// client has many chunks in flight.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Maximum message size in bytes (80 MiB).
///
/// Must exceed the largest negotiable chunk plus its frame header.
pub const WS_MAX_MESSAGE_SIZE: usize = 80 * 1024 * 1024;

/// Timeout for text request/response operations (complete, status, cancel).
///
/// `complete` streams the whole artifact into storage before replying,
/// so this is deliberately generous.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for binary chunk uploads when the caller sets none.
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Handshake
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "welcome")]
    Welcome,

    // Requests from client to server
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "complete_upload")]
    CompleteUpload,
    #[serde(rename = "upload_status")]
    UploadStatus,
    #[serde(rename = "cancel_upload")]
    CancelUpload,

    // Responses from server to client
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "upload_chunk_response")]
    UploadChunkResponse,
    #[serde(rename = "complete_upload_response")]
    CompleteUploadResponse,
    #[serde(rename = "upload_status_response")]
    UploadStatusResponse,
    #[serde(rename = "cancel_upload_response")]
    CancelUploadResponse,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}
