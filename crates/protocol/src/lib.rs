//! Wire protocol shared by the chunkline upload server and client.
//!
//! The four logical operations (upload chunk, complete, status, cancel)
//! are described by plain serde types in [`messages`]. [`envelope`] wraps
//! them for text transport, [`frame`] encodes binary chunk frames, and
//! [`error`] holds the error taxonomy both sides classify failures with.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{ErrorBody, Message};
pub use error::ErrorKind;
pub use messages::{
    ArtifactDescriptor, ChunkTarget, UploadChunkRequest, UploadChunkResponse,
    UploadStatusResponse,
};
pub use types::SessionState;
