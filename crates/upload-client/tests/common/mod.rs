//! In-process transport over an `UploadService` with scripted faults.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkline_protocol::{
    ArtifactDescriptor, ChunkTarget, ErrorBody, ErrorKind, UploadChunkRequest,
    UploadChunkResponse, UploadStatusResponse,
};
use chunkline_upload_client::{ClientError, UploadTransport};
use chunkline_upload_server::{
    CallerIdentity, MemoryArtifactSink, MemoryBlobStorage, MemoryChunkStaging, StoreConfig,
    UploadError, UploadService,
};
use futures_util::future::BoxFuture;
use tokio::sync::watch;

pub const CALLER: &str = "alice";

pub struct LocalTransport {
    pub service: UploadService,
    pub storage: Arc<MemoryBlobStorage>,
    caller: CallerIdentity,
    chunk_faults: Mutex<HashMap<u32, VecDeque<ErrorKind>>>,
    complete_faults: Mutex<VecDeque<ErrorKind>>,
    /// Chunks acknowledged once without reaching the server.
    lose_once: Mutex<HashSet<u32>>,
    sent: Mutex<Vec<u32>>,
    chunk_delay: Mutex<Option<Duration>>,
    stall_once: Mutex<HashMap<u32, Duration>>,
    hold_from: Mutex<Option<u32>>,
    release: watch::Sender<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancels: AtomicUsize,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        let storage = Arc::new(MemoryBlobStorage::new());
        let service = UploadService::new(
            StoreConfig::default(),
            Arc::new(MemoryChunkStaging::new()),
            storage.clone(),
            Arc::new(MemoryArtifactSink::new()),
        );
        let (release, _) = watch::channel(false);
        Arc::new(Self {
            service,
            storage,
            caller: CallerIdentity::new(CALLER),
            chunk_faults: Mutex::new(HashMap::new()),
            complete_faults: Mutex::new(VecDeque::new()),
            lose_once: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            chunk_delay: Mutex::new(None),
            stall_once: Mutex::new(HashMap::new()),
            hold_from: Mutex::new(None),
            release,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    /// The next attempts for `index` fail with `kinds`, in order.
    pub fn fail_chunk(&self, index: u32, kinds: &[ErrorKind]) {
        self.chunk_faults
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .extend(kinds.iter().copied());
    }

    pub fn fail_complete(&self, kinds: &[ErrorKind]) {
        self.complete_faults
            .lock()
            .unwrap()
            .extend(kinds.iter().copied());
    }

    /// Acknowledges `index` once without storing it.
    pub fn lose_chunk_once(&self, index: u32) {
        self.lose_once.lock().unwrap().insert(index);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock().unwrap() = Some(delay);
    }

    /// The next attempt for `index` sleeps `delay` before reaching the
    /// service.
    pub fn stall_chunk_once(&self, index: u32, delay: Duration) {
        self.stall_once.lock().unwrap().insert(index, delay);
    }

    /// Chunks with index `>= index` hang until [`release`](Self::release).
    pub fn hold_from(&self, index: u32) {
        *self.hold_from.lock().unwrap() = Some(index);
    }

    pub fn release(&self) {
        self.release.send_replace(true);
    }

    /// Chunk indices that reached the service, in arrival order.
    pub fn sent(&self) -> Vec<u32> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Creates a session directly on the service and stores `indices`.
    pub async fn seed_session(
        &self,
        data: &[u8],
        chunk_size: u64,
        indices: &[u32],
    ) -> String {
        let total = data.len().div_ceil(chunk_size as usize) as u32;
        let mut upload_id: Option<String> = None;
        for &index in indices {
            let start = index as usize * chunk_size as usize;
            let end = (start + chunk_size as usize).min(data.len());
            let target = match &upload_id {
                Some(id) => ChunkTarget::ExistingSession {
                    upload_id: id.clone(),
                },
                None => ChunkTarget::NewSession {
                    file_name: "seeded.bin".into(),
                    file_size: data.len() as u64,
                    mime_type: "application/octet-stream".into(),
                    chunk_size,
                    total_chunks: total,
                    workspace_context: None,
                },
            };
            let resp = self
                .service
                .upload_chunk(
                    UploadChunkRequest {
                        target,
                        chunk_index: index,
                        checksum: None,
                        payload: data[start..end].to_vec(),
                    },
                    &self.caller,
                )
                .await
                .unwrap();
            upload_id = Some(resp.upload_id);
        }
        upload_id.expect("seed at least one chunk")
    }

    fn injected(kind: ErrorKind) -> ClientError {
        ClientError::from_body(ErrorBody::new(kind, "injected failure"))
    }

    fn remote(err: UploadError) -> ClientError {
        ClientError::from_body(err.to_error_body())
    }

    async fn wait_if_held(&self, index: u32) {
        let held = matches!(*self.hold_from.lock().unwrap(), Some(from) if index >= from);
        if held {
            let mut rx = self.release.subscribe();
            let _ = rx.wait_for(|open| *open).await;
        }
    }

    async fn chunk(&self, req: UploadChunkRequest) -> Result<UploadChunkResponse, ClientError> {
        let index = req.chunk_index;
        let fault = self
            .chunk_faults
            .lock()
            .unwrap()
            .get_mut(&index)
            .and_then(VecDeque::pop_front);
        if let Some(kind) = fault {
            return Err(Self::injected(kind));
        }

        self.wait_if_held(index).await;
        let stall = self.stall_once.lock().unwrap().remove(&index);
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        let delay = *self.chunk_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let ChunkTarget::ExistingSession { upload_id } = &req.target {
            if self.lose_once.lock().unwrap().remove(&index) {
                return Ok(UploadChunkResponse {
                    upload_id: upload_id.clone(),
                    chunk_index: index,
                    received_count: 0,
                    total_count: 0,
                });
            }
        }

        self.sent.lock().unwrap().push(index);
        self.service
            .upload_chunk(req, &self.caller)
            .await
            .map_err(Self::remote)
    }
}

struct InFlight<'a>(&'a LocalTransport);

impl<'a> InFlight<'a> {
    fn enter(t: &'a LocalTransport) -> Self {
        let now = t.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        t.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(t)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UploadTransport for LocalTransport {
    fn upload_chunk(
        &self,
        req: UploadChunkRequest,
    ) -> BoxFuture<'_, Result<UploadChunkResponse, ClientError>> {
        Box::pin(async move {
            let _guard = InFlight::enter(self);
            self.chunk(req).await
        })
    }

    fn complete<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<ArtifactDescriptor, ClientError>> {
        Box::pin(async move {
            let fault = self.complete_faults.lock().unwrap().pop_front();
            if let Some(kind) = fault {
                return Err(Self::injected(kind));
            }
            self.service
                .complete(upload_id, &self.caller)
                .await
                .map_err(Self::remote)
        })
    }

    fn status<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<UploadStatusResponse, ClientError>> {
        Box::pin(async move {
            self.service
                .status(upload_id, &self.caller)
                .map_err(Self::remote)
        })
    }

    fn cancel<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.service
                .cancel(upload_id, &self.caller)
                .await
                .map_err(Self::remote)
        })
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
