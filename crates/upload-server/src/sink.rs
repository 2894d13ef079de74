//! Hand-off of finished artifacts to the file-metadata owner.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use chunkline_protocol::ArtifactDescriptor;

use crate::error::StorageError;
use crate::identity::CallerIdentity;
use crate::session::UploadSession;

/// Everything the metadata owner needs to register an assembled file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: String,
    pub upload_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub storage_key: String,
    pub owner: CallerIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_context: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn new(artifact: &ArtifactDescriptor, session: &UploadSession) -> Self {
        Self {
            id: artifact.id.clone(),
            upload_id: session.upload_id.clone(),
            name: artifact.name.clone(),
            size: artifact.size,
            mime_type: artifact.mime_type.clone(),
            storage_key: artifact.storage_key.clone(),
            owner: session.owner.clone(),
            workspace_context: session.workspace_context.clone(),
            created_at: artifact.created_at,
        }
    }
}

/// Receives one record per completed upload.
pub trait ArtifactSink: Send + Sync {
    fn record(&self, record: ArtifactRecord) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// Appends records as JSON lines to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl ArtifactSink for JsonLinesSink {
    fn record(&self, record: ArtifactRecord) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');

            let _guard = self.lock.lock().await;
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

/// Collects records in memory.
#[derive(Default)]
pub struct MemoryArtifactSink {
    records: Mutex<Vec<ArtifactRecord>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ArtifactRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ArtifactSink for MemoryArtifactSink {
    fn record(&self, record: ArtifactRecord) -> BoxFuture<'_, Result<(), StorageError>> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> ArtifactRecord {
        ArtifactRecord {
            id: id.into(),
            upload_id: "u-1".into(),
            name: "video.mp4".into(),
            size: 42,
            mime_type: "video/mp4".into(),
            storage_key: format!("artifacts/{id}"),
            owner: CallerIdentity::new("alice"),
            workspace_context: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn json_lines_appends_one_record_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta").join("artifacts.jsonl");
        let sink = JsonLinesSink::new(&path);

        sink.record(record("a1")).await.unwrap();
        sink.record(record("a2")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<ArtifactRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "a1");
        assert_eq!(parsed[1].storage_key, "artifacts/a2");
    }

    #[tokio::test]
    async fn memory_sink_collects() {
        let sink = MemoryArtifactSink::new();
        sink.record(record("a1")).await.unwrap();
        assert_eq!(sink.records().len(), 1);
    }
}
