//! WebSocket server for the chunkline upload service.
//!
//! Accepts any number of client connections, runs a read and a write pump
//! per connection, requires a `hello` handshake that binds the connection
//! to a caller identity, and dispatches JSON requests and binary chunk
//! frames to a [`Handler`]. [`UploadHandler`] is the handler backed by
//! [`chunkline_upload_server::UploadService`].

mod connection;
mod handler;
mod server;
mod upload_handler;

pub use connection::{ClientConnection, ConnectionMeta, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};
pub use upload_handler::UploadHandler;

/// Send buffer capacity per connection.
///
/// Every chunk frame is answered by one text frame; the buffer only needs
/// to absorb the acks of a burst of concurrent chunk writes.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection limit reached")]
    TooManyConnections,
}
