use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SessionState;

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First message a client sends after the socket opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub token: String,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_name: String,
}

/// Server answer to a successful `hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeResponse {
    /// Identity the token resolved to; every session created on this
    /// connection is owned by it.
    pub identity: String,
    pub protocol_version: u32,
    pub server_name: String,
    /// Largest chunk the server accepts.
    pub max_chunk_size: u64,
}

// ---------------------------------------------------------------------------
// Upload chunk
// ---------------------------------------------------------------------------

/// Where an uploaded chunk belongs.
///
/// The first chunk of a file carries the file metadata and creates the
/// session; every later chunk names the session the server handed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChunkTarget {
    NewSession {
        file_name: String,
        file_size: u64,
        mime_type: String,
        chunk_size: u64,
        total_chunks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_context: Option<String>,
    },
    ExistingSession {
        upload_id: String,
    },
}

impl ChunkTarget {
    /// Returns the session id when the target names one.
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            ChunkTarget::ExistingSession { upload_id } => Some(upload_id),
            ChunkTarget::NewSession { .. } => None,
        }
    }
}

/// JSON header of a binary chunk frame (see [`crate::frame`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrameHeader {
    /// Request id; the `upload_chunk_response` echoes it.
    pub id: String,
    pub target: ChunkTarget,
    pub chunk_index: u32,
    /// Hex SHA-256 of the payload. Empty means unchecked.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Transport-neutral upload-chunk request.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadChunkRequest {
    pub target: ChunkTarget,
    pub chunk_index: u32,
    pub checksum: Option<String>,
    pub payload: Vec<u8>,
}

impl UploadChunkRequest {
    /// Splits the request into a frame header and its payload.
    pub fn into_frame_parts(self, id: impl Into<String>) -> (ChunkFrameHeader, Vec<u8>) {
        let header = ChunkFrameHeader {
            id: id.into(),
            target: self.target,
            chunk_index: self.chunk_index,
            checksum: self.checksum.unwrap_or_default(),
        };
        (header, self.payload)
    }

    /// Rebuilds a request from a received frame.
    pub fn from_frame_parts(header: ChunkFrameHeader, payload: Vec<u8>) -> Self {
        Self {
            target: header.target,
            chunk_index: header.chunk_index,
            checksum: (!header.checksum.is_empty()).then_some(header.checksum),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub upload_id: String,
    pub chunk_index: u32,
    pub received_count: u32,
    pub total_count: u32,
}

// ---------------------------------------------------------------------------
// Complete / status / cancel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub upload_id: String,
}

/// Descriptor of an assembled file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusRequest {
    pub upload_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub state: SessionState,
    pub total_chunks: u32,
    /// Received indices, ascending.
    pub received_chunks: Vec<u32>,
    /// Missing indices, ascending.
    pub missing_chunks: Vec<u32>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadRequest {
    pub upload_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelUploadResponse {
    pub success: bool,
}
