//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw payload.

use crate::messages::ChunkFrameHeader;

const LEN_PREFIX: usize = 4;

/// Encodes a chunk frame for sending over WebSocket.
pub fn encode_chunk_frame(
    header: &ChunkFrameHeader,
    payload: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(LEN_PREFIX + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parses a raw binary WebSocket frame into its header and payload.
pub fn parse_chunk_frame(data: &[u8]) -> Result<(ChunkFrameHeader, Vec<u8>), FrameError> {
    if data.len() < LEN_PREFIX {
        return Err(FrameError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let available = data.len() - LEN_PREFIX;
    if available < header_len {
        return Err(FrameError::HeaderTruncated {
            expected: header_len,
            got: available,
        });
    }

    let header_bytes = &data[LEN_PREFIX..LEN_PREFIX + header_len];
    let header: ChunkFrameHeader =
        serde_json::from_slice(header_bytes).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let payload = data[LEN_PREFIX + header_len..].to_vec();
    Ok((header, payload))
}

/// Best-effort extraction of the request id from a frame that failed to
/// parse, so the error reply can still be correlated.
pub fn peek_frame_id(data: &[u8]) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct IdOnly {
        id: String,
    }

    let len_bytes: [u8; 4] = data.get(..LEN_PREFIX)?.try_into().ok()?;
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    let header = data.get(LEN_PREFIX..LEN_PREFIX.checked_add(header_len)?)?;
    serde_json::from_slice::<IdOnly>(header).ok().map(|h| h.id)
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}
