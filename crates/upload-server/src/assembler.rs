//! Chunk assembler: turns a fully received session into one artifact.

use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;

use chunkline_protocol::{ArtifactDescriptor, SessionState};

use crate::error::UploadError;
use crate::identity::CallerIdentity;
use crate::session::UploadSession;
use crate::sink::{ArtifactRecord, ArtifactSink};
use crate::storage::{BlobStorage, ByteStream};
use crate::store::{SessionSlot, SessionStore, check_owner};

/// Assembles staged chunks into final artifacts.
pub struct Assembler {
    store: Arc<SessionStore>,
    storage: Arc<dyn BlobStorage>,
    sink: Arc<dyn ArtifactSink>,
}

impl Assembler {
    pub fn new(
        store: Arc<SessionStore>,
        storage: Arc<dyn BlobStorage>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            store,
            storage,
            sink,
        }
    }

    /// Assembles the session and returns its artifact.
    ///
    /// Runs at most once per session: a concurrent call waits for the
    /// running one and returns the same artifact. On failure the session
    /// stays Active with every staged chunk intact.
    pub async fn complete(
        &self,
        upload_id: &str,
        caller: &CallerIdentity,
    ) -> Result<ArtifactDescriptor, UploadError> {
        let slot = self.store.require(upload_id)?;
        let done = check_completable(&slot.record(), caller)?;
        if let Some(artifact) = done {
            return Ok(artifact);
        }

        let _gate = slot.gate.write().await;

        let snapshot = {
            let mut record = slot.record();
            if let Some(artifact) = check_completable(&record, caller)? {
                return Ok(artifact);
            }
            let missing = record.missing();
            if !missing.is_empty() {
                return Err(UploadError::IncompleteUpload { missing });
            }
            record.completing = true;
            record.clone()
        };
        let completing = CompletingFlag { slot: &slot };

        let result = self.assemble(&snapshot).await;
        drop(completing);

        let artifact = {
            let mut record = slot.record();
            match result {
                Ok(artifact) => {
                    record.finish(SessionState::Completed, Utc::now());
                    record.artifact = Some(artifact.clone());
                    artifact
                }
                Err(e) => {
                    tracing::warn!(upload_id = %upload_id, "assembly failed: {e}");
                    return Err(e);
                }
            }
        };

        if let Err(e) = self.store.staging().delete_chunks(upload_id).await {
            tracing::warn!(upload_id = %upload_id, "failed to delete staged chunks: {e}");
        }
        if let Err(e) = self.store.persist(&slot).await {
            tracing::error!(upload_id = %upload_id, "failed to persist completion: {e}");
        }

        let record = ArtifactRecord::new(&artifact, &snapshot);
        if let Err(e) = self.sink.record(record).await {
            tracing::error!(
                upload_id = %upload_id,
                artifact_id = %artifact.id,
                "failed to hand off artifact record: {e}"
            );
        }

        tracing::info!(
            upload_id = %upload_id,
            artifact_id = %artifact.id,
            storage_key = %artifact.storage_key,
            size = artifact.size,
            "upload assembled"
        );
        Ok(artifact)
    }

    /// Streams staged chunks in index order into a fresh storage object.
    async fn assemble(&self, session: &UploadSession) -> Result<ArtifactDescriptor, UploadError> {
        let artifact_id = uuid::Uuid::new_v4().to_string();
        let key = format!("artifacts/{artifact_id}");
        let staging = Arc::clone(self.store.staging());
        let upload_id = session.upload_id.clone();

        let chunks: ByteStream<'_> = stream::iter(0..session.total_chunks)
            .then(move |index| {
                let staging = Arc::clone(&staging);
                let upload_id = upload_id.clone();
                async move { staging.read_chunk(&upload_id, index).await }
            })
            .boxed();

        let written = match self.storage.write(&key, chunks).await {
            Ok(n) => n,
            Err(e) => {
                self.discard_partial(&key).await;
                return Err(e.into());
            }
        };

        if written != session.declared_size {
            self.discard_partial(&key).await;
            return Err(UploadError::SizeMismatch {
                expected: session.declared_size,
                actual: written,
            });
        }

        Ok(ArtifactDescriptor {
            id: artifact_id,
            name: session.file_name.clone(),
            size: written,
            mime_type: session.mime_type.clone(),
            storage_key: key,
            created_at: Utc::now(),
        })
    }

    async fn discard_partial(&self, key: &str) {
        if let Err(e) = self.storage.delete(key).await {
            tracing::warn!(storage_key = %key, "failed to delete partial artifact: {e}");
        }
    }
}

/// Returns the stored artifact when the session is already completed.
fn check_completable(
    record: &UploadSession,
    caller: &CallerIdentity,
) -> Result<Option<ArtifactDescriptor>, UploadError> {
    check_owner(record, caller)?;
    match record.state {
        SessionState::Completed => record
            .artifact
            .clone()
            .map(Some)
            .ok_or_else(|| UploadError::NotFound(record.upload_id.clone())),
        SessionState::Cancelled | SessionState::Expired => {
            Err(UploadError::NotFound(record.upload_id.clone()))
        }
        SessionState::Active => Ok(None),
    }
}

/// Clears `completing` when dropped, so an abandoned `complete` future
/// does not pin the session.
struct CompletingFlag<'a> {
    slot: &'a SessionSlot,
}

impl Drop for CompletingFlag<'_> {
    fn drop(&mut self) {
        self.slot.record().completing = false;
    }
}
