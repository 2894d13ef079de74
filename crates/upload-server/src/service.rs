//! The four protocol operations over the store and assembler.

use std::sync::Arc;

use chunkline_protocol::{
    ArtifactDescriptor, ChunkTarget, UploadChunkRequest, UploadChunkResponse,
    UploadStatusResponse,
};
use chunkline_transfer::verify_checksum;

use crate::assembler::Assembler;
use crate::config::StoreConfig;
use crate::error::UploadError;
use crate::identity::CallerIdentity;
use crate::session::NewSession;
use crate::sink::ArtifactSink;
use crate::staging::ChunkStaging;
use crate::storage::BlobStorage;
use crate::store::SessionStore;

/// Transport-neutral entry point for upload requests.
#[derive(Clone)]
pub struct UploadService {
    store: Arc<SessionStore>,
    assembler: Arc<Assembler>,
}

impl UploadService {
    pub fn new(
        config: StoreConfig,
        staging: Arc<dyn ChunkStaging>,
        storage: Arc<dyn BlobStorage>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        let store = Arc::new(SessionStore::new(config, staging));
        let assembler = Arc::new(Assembler::new(Arc::clone(&store), storage, sink));
        Self { store, assembler }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Stores one chunk, creating the session first for a
    /// [`ChunkTarget::NewSession`] target.
    pub async fn upload_chunk(
        &self,
        req: UploadChunkRequest,
        caller: &CallerIdentity,
    ) -> Result<UploadChunkResponse, UploadError> {
        let limit = self.store.config().max_chunk_size;
        let size = req.payload.len() as u64;
        if size > limit {
            return Err(UploadError::PayloadTooLarge { size, limit });
        }

        if let Some(expected) = req.checksum.as_deref() {
            verify_checksum(&req.payload, expected)
                .map_err(|e| UploadError::CorruptChunk(e.to_string()))?;
        }

        let receipt = match req.target {
            ChunkTarget::ExistingSession { upload_id } => {
                self.store
                    .receive_chunk(&upload_id, req.chunk_index, &req.payload, caller)
                    .await?
            }
            ChunkTarget::NewSession {
                file_name,
                file_size,
                mime_type,
                chunk_size,
                total_chunks,
                workspace_context,
            } => {
                let new = NewSession {
                    file_name,
                    declared_size: file_size,
                    mime_type,
                    chunk_size,
                    workspace_context,
                };
                let layout = self.store.validate_new(&new)?;
                if layout.total_chunks() != total_chunks {
                    return Err(UploadError::InvalidArgument(format!(
                        "declared {total_chunks} chunks, layout has {}",
                        layout.total_chunks()
                    )));
                }
                match layout.chunk_len(req.chunk_index) {
                    Some(len) if len == size => {}
                    Some(len) => {
                        return Err(UploadError::InvalidArgument(format!(
                            "chunk {} has {size} bytes, expected {len}",
                            req.chunk_index
                        )));
                    }
                    None => {
                        return Err(UploadError::InvalidArgument(format!(
                            "chunk index {} out of range (total {total_chunks})",
                            req.chunk_index
                        )));
                    }
                }

                let upload_id = self.store.create_session(new, caller.clone()).await?;
                match self
                    .store
                    .receive_chunk(&upload_id, req.chunk_index, &req.payload, caller)
                    .await
                {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        // The caller never learned this id; drop the session.
                        self.store.discard(&upload_id).await;
                        return Err(e);
                    }
                }
            }
        };

        if self.store.config().assemble_on_last_chunk
            && receipt.received_count == receipt.total_count
        {
            self.assemble_in_background(receipt.upload_id.clone(), caller.clone());
        }

        Ok(receipt)
    }

    pub async fn complete(
        &self,
        upload_id: &str,
        caller: &CallerIdentity,
    ) -> Result<ArtifactDescriptor, UploadError> {
        self.assembler.complete(upload_id, caller).await
    }

    pub fn status(
        &self,
        upload_id: &str,
        caller: &CallerIdentity,
    ) -> Result<UploadStatusResponse, UploadError> {
        self.store.status(upload_id, caller)
    }

    pub async fn cancel(&self, upload_id: &str, caller: &CallerIdentity) -> Result<(), UploadError> {
        self.store.cancel(upload_id, caller).await
    }

    /// Reloads sessions persisted by an earlier process.
    pub async fn recover(&self) -> Result<usize, UploadError> {
        self.store.recover().await
    }

    fn assemble_in_background(&self, upload_id: String, caller: CallerIdentity) {
        let assembler = Arc::clone(&self.assembler);
        tokio::spawn(async move {
            match assembler.complete(&upload_id, &caller).await {
                Ok(artifact) => {
                    tracing::debug!(upload_id = %upload_id, artifact_id = %artifact.id, "assembled on last chunk");
                }
                Err(e) => {
                    tracing::warn!(upload_id = %upload_id, "assembly on last chunk failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryArtifactSink;
    use crate::staging::MemoryChunkStaging;
    use crate::storage::MemoryBlobStorage;
    use chunkline_protocol::{ErrorKind, SessionState};
    use chunkline_transfer::checksum_bytes;

    struct Fixture {
        service: UploadService,
        storage: Arc<MemoryBlobStorage>,
        staging: Arc<MemoryChunkStaging>,
    }

    fn fixture(config: StoreConfig) -> Fixture {
        let staging = Arc::new(MemoryChunkStaging::new());
        let storage = Arc::new(MemoryBlobStorage::new());
        let service = UploadService::new(
            config,
            staging.clone(),
            storage.clone(),
            Arc::new(MemoryArtifactSink::new()),
        );
        Fixture {
            service,
            storage,
            staging,
        }
    }

    fn alice() -> CallerIdentity {
        CallerIdentity::new("alice")
    }

    fn new_target(file_size: u64, chunk_size: u64, total_chunks: u32) -> ChunkTarget {
        ChunkTarget::NewSession {
            file_name: "video.mp4".into(),
            file_size,
            mime_type: "video/mp4".into(),
            chunk_size,
            total_chunks,
            workspace_context: None,
        }
    }

    fn existing(upload_id: &str) -> ChunkTarget {
        ChunkTarget::ExistingSession {
            upload_id: upload_id.into(),
        }
    }

    fn chunk(target: ChunkTarget, index: u32, payload: Vec<u8>) -> UploadChunkRequest {
        UploadChunkRequest {
            target,
            chunk_index: index,
            checksum: Some(checksum_bytes(&payload)),
            payload,
        }
    }

    #[tokio::test]
    async fn three_chunk_upload_end_to_end() {
        let f = fixture(StoreConfig::default());
        let data: Vec<u8> = (0..2_500_000u32).map(|i| (i % 253) as u8).collect();

        let first = f
            .service
            .upload_chunk(
                chunk(new_target(2_500_000, 1_000_000, 3), 0, data[..1_000_000].to_vec()),
                &alice(),
            )
            .await
            .unwrap();
        assert_eq!(first.total_count, 3);
        let id = first.upload_id;

        // Last chunk before the middle one.
        let r = f
            .service
            .upload_chunk(chunk(existing(&id), 2, data[2_000_000..].to_vec()), &alice())
            .await
            .unwrap();
        assert_eq!(r.received_count, 2);
        f.service
            .upload_chunk(
                chunk(existing(&id), 1, data[1_000_000..2_000_000].to_vec()),
                &alice(),
            )
            .await
            .unwrap();

        let artifact = f.service.complete(&id, &alice()).await.unwrap();
        assert_eq!(artifact.size, 2_500_000);
        assert_eq!(f.storage.get(&artifact.storage_key).unwrap(), data);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_transient_and_stores_nothing() {
        let f = fixture(StoreConfig::default());
        let mut req = chunk(new_target(10, 10, 1), 0, vec![1; 10]);
        req.checksum = Some(checksum_bytes(b"something else"));

        let err = f.service.upload_chunk(req, &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(f.service.store().is_empty());
    }

    #[tokio::test]
    async fn new_session_with_wrong_total_is_rejected() {
        let f = fixture(StoreConfig::default());
        let req = chunk(new_target(2_500_000, 1_000_000, 2), 0, vec![0; 1_000_000]);
        let err = f.service.upload_chunk(req, &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(f.service.store().is_empty());
    }

    #[tokio::test]
    async fn new_session_with_bad_first_chunk_leaves_no_session() {
        let f = fixture(StoreConfig::default());
        let req = chunk(new_target(3000, 1000, 3), 0, vec![0; 999]);
        let err = f.service.upload_chunk(req, &alice()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(f.service.store().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_first_chunk_discards_new_session() {
        let f = fixture(StoreConfig {
            max_concurrent_chunk_writes: 1,
            ..StoreConfig::default()
        });
        // Hold the only staging slot through a write parked on the gate.
        let id = f
            .service
            .upload_chunk(chunk(new_target(20, 10, 2), 0, vec![0; 10]), &alice())
            .await
            .unwrap()
            .upload_id;
        let slot = f.service.store().slot(&id).unwrap();
        let gate = slot.gate.write().await;
        let blocked = {
            let service = f.service.clone();
            let id = id.clone();
            tokio::spawn(async move {
                service
                    .upload_chunk(chunk(existing(&id), 1, vec![1; 10]), &alice())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let err = f
            .service
            .upload_chunk(chunk(new_target(10, 10, 1), 0, vec![2; 10]), &alice())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(f.service.store().len(), 1);

        drop(gate);
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn assembles_on_last_chunk_when_enabled() {
        let f = fixture(StoreConfig {
            assemble_on_last_chunk: true,
            ..StoreConfig::default()
        });
        let id = f
            .service
            .upload_chunk(chunk(new_target(20, 10, 2), 0, vec![0; 10]), &alice())
            .await
            .unwrap()
            .upload_id;
        f.service
            .upload_chunk(chunk(existing(&id), 1, vec![1; 10]), &alice())
            .await
            .unwrap();

        // The explicit call waits for the background assembly and returns
        // its artifact.
        let artifact = f.service.complete(&id, &alice()).await.unwrap();
        assert_eq!(f.storage.len(), 1);
        assert_eq!(artifact.size, 20);
        assert_eq!(
            f.service.status(&id, &alice()).unwrap().state,
            SessionState::Completed
        );
        assert_eq!(f.staging.staged_chunks(&id), 0);
    }

    #[tokio::test]
    async fn cancel_then_status_is_not_found() {
        let f = fixture(StoreConfig::default());
        let id = f
            .service
            .upload_chunk(chunk(new_target(20, 10, 2), 0, vec![0; 10]), &alice())
            .await
            .unwrap()
            .upload_id;
        f.service.cancel(&id, &alice()).await.unwrap();
        let err = f.service.status(&id, &alice()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
