use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chunkline_protocol::{ArtifactDescriptor, SessionState, UploadStatusResponse};
use chunkline_transfer::ChunkLayout;

use crate::identity::CallerIdentity;

/// Metadata supplied when a session is created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub file_name: String,
    pub declared_size: u64,
    pub mime_type: String,
    pub chunk_size: u64,
    pub workspace_context: Option<String>,
}

/// Server record of one upload. Also the on-disk manifest format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    pub file_name: String,
    pub declared_size: u64,
    pub mime_type: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received: BTreeSet<u32>,
    pub owner: CallerIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: SessionState,
    /// When the session entered a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactDescriptor>,
    /// Set while the assembler holds the session.
    #[serde(skip)]
    pub(crate) completing: bool,
}

impl UploadSession {
    pub(crate) fn new(
        upload_id: String,
        req: NewSession,
        layout: &ChunkLayout,
        owner: CallerIdentity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            upload_id,
            file_name: req.file_name,
            declared_size: layout.file_size(),
            mime_type: req.mime_type,
            chunk_size: layout.chunk_size(),
            total_chunks: layout.total_chunks(),
            received: BTreeSet::new(),
            owner,
            workspace_context: req.workspace_context,
            created_at: now,
            last_activity_at: now,
            state: SessionState::Active,
            finished_at: None,
            artifact: None,
            completing: false,
        }
    }

    /// Rebuilds the chunk layout, or `None` for a corrupt record.
    pub fn layout(&self) -> Option<ChunkLayout> {
        ChunkLayout::new(self.declared_size, self.chunk_size)
            .ok()
            .filter(|l| l.total_chunks() == self.total_chunks)
    }

    /// Expected payload length of chunk `index`.
    pub fn expected_len(&self, index: u32) -> Option<u64> {
        self.layout()?.chunk_len(index)
    }

    /// Missing chunk indices, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    pub fn is_fully_received(&self) -> bool {
        self.received.len() as u64 == u64::from(self.total_chunks)
    }

    pub(crate) fn finish(&mut self, state: SessionState, now: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(now);
        self.last_activity_at = now;
    }

    /// Status snapshot reported to clients.
    pub fn status(&self) -> UploadStatusResponse {
        let (received, missing) = if self.state == SessionState::Completed {
            ((0..self.total_chunks).collect(), Vec::new())
        } else {
            (self.received.iter().copied().collect(), self.missing())
        };
        UploadStatusResponse {
            upload_id: self.upload_id.clone(),
            state: self.state,
            total_chunks: self.total_chunks,
            received_chunks: received,
            missing_chunks: missing,
            last_activity_at: self.last_activity_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(size: u64, chunk: u64) -> UploadSession {
        let layout = ChunkLayout::new(size, chunk).unwrap();
        UploadSession::new(
            "u-1".into(),
            NewSession {
                file_name: "f.bin".into(),
                declared_size: size,
                mime_type: "application/octet-stream".into(),
                chunk_size: chunk,
                workspace_context: None,
            },
            &layout,
            CallerIdentity::new("alice"),
            Utc::now(),
        )
    }

    #[test]
    fn missing_is_ascending_complement() {
        let mut s = session(5000, 1000);
        s.received.extend([3, 0, 1]);
        assert_eq!(s.missing(), vec![2, 4]);
        assert!(!s.is_fully_received());
        s.received.extend([2, 4]);
        assert!(s.missing().is_empty());
        assert!(s.is_fully_received());
    }

    #[test]
    fn status_of_completed_session_reports_nothing_missing() {
        let mut s = session(3000, 1000);
        s.received.insert(1);
        s.finish(SessionState::Completed, Utc::now());
        let status = s.status();
        assert_eq!(status.received_chunks, vec![0, 1, 2]);
        assert!(status.missing_chunks.is_empty());
        assert_eq!(status.state, SessionState::Completed);
    }

    #[test]
    fn manifest_roundtrip_drops_completing_flag() {
        let mut s = session(2_500_000, 1_000_000);
        s.received.insert(2);
        s.completing = true;
        let json = serde_json::to_string(&s).unwrap();
        let back: UploadSession = serde_json::from_str(&json).unwrap();
        assert!(!back.completing);
        assert_eq!(back.received, s.received);
        assert_eq!(back.expected_len(2), Some(500_000));
    }

    #[test]
    fn corrupt_manifest_has_no_layout() {
        let mut s = session(3000, 1000);
        s.total_chunks = 7;
        assert!(s.layout().is_none());
    }
}
