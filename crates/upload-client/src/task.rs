//! Client-side state of one upload.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chunkline_protocol::ArtifactDescriptor;
use chunkline_transfer::{ChunkLayout, SpeedCalculator};
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::source::ChunkSource;
use crate::types::{ChunkDescriptor, ChunkStatus, TaskStatus};

/// Why a running task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopRequest {
    Pause,
    Cancel,
}

struct TaskState {
    status: TaskStatus,
    failure_reason: Option<String>,
    artifact: Option<ArtifactDescriptor>,
    run_token: CancellationToken,
    stop: Option<StopRequest>,
}

/// One file being uploaded.
///
/// Every chunk descriptor sits behind its own lock; the task status has a
/// separate one. No lock is held across an await.
pub struct UploadTask {
    file_id: String,
    source: Arc<dyn ChunkSource>,
    file_name: String,
    mime_type: String,
    workspace_context: Option<String>,
    layout: ChunkLayout,
    chunks: Vec<Mutex<ChunkDescriptor>>,
    acked_bytes: AtomicU64,
    upload_id: Mutex<Option<String>>,
    state: Mutex<TaskState>,
    speed: SpeedCalculator,
}

/// Point-in-time copy of a task for display.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub file_id: String,
    pub upload_id: Option<String>,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub status: TaskStatus,
    pub failure_reason: Option<String>,
    pub acked_bytes: u64,
    pub chunks: Vec<ChunkDescriptor>,
}

impl TaskSnapshot {
    /// Fraction of the file acknowledged by the server, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 0.0;
        }
        self.acked_bytes as f64 / self.file_size as f64
    }
}

impl UploadTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        file_id: String,
        source: Arc<dyn ChunkSource>,
        file_name: String,
        mime_type: String,
        workspace_context: Option<String>,
        layout: ChunkLayout,
        upload_id: Option<String>,
        status: TaskStatus,
    ) -> Self {
        let chunks = layout
            .spans()
            .map(|span| {
                Mutex::new(ChunkDescriptor {
                    index: span.index,
                    offset: span.offset,
                    len: span.len,
                    status: ChunkStatus::Pending,
                    retry_count: 0,
                })
            })
            .collect();
        Self {
            file_id,
            source,
            file_name,
            mime_type,
            workspace_context,
            layout,
            chunks,
            acked_bytes: AtomicU64::new(0),
            upload_id: Mutex::new(upload_id),
            state: Mutex::new(TaskState {
                status,
                failure_reason: None,
                artifact: None,
                run_token: CancellationToken::new(),
                stop: None,
            }),
            speed: SpeedCalculator::new(None, None),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn workspace_context(&self) -> Option<&str> {
        self.workspace_context.as_deref()
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub(crate) fn source(&self) -> &Arc<dyn ChunkSource> {
        &self.source
    }

    pub(crate) fn speed(&self) -> &SpeedCalculator {
        &self.speed
    }

    pub fn upload_id(&self) -> Option<String> {
        lock(&self.upload_id).clone()
    }

    pub(crate) fn set_upload_id(&self, upload_id: String) {
        *lock(&self.upload_id) = Some(upload_id);
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.state).status
    }

    pub fn failure_reason(&self) -> Option<String> {
        lock(&self.state).failure_reason.clone()
    }

    pub fn artifact(&self) -> Option<ArtifactDescriptor> {
        lock(&self.state).artifact.clone()
    }

    pub fn acked_bytes(&self) -> u64 {
        self.acked_bytes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let (status, failure_reason) = {
            let state = lock(&self.state);
            (state.status, state.failure_reason.clone())
        };
        TaskSnapshot {
            file_id: self.file_id.clone(),
            upload_id: self.upload_id(),
            file_name: self.file_name.clone(),
            file_size: self.layout.file_size(),
            chunk_size: self.layout.chunk_size(),
            status,
            failure_reason,
            acked_bytes: self.acked_bytes(),
            chunks: self.chunks.iter().map(|c| lock(c).clone()).collect(),
        }
    }

    // -- run control ------------------------------------------------------

    /// Moves the task to `Uploading` if `allowed` accepts its current
    /// status and hands out a fresh cancellation token for the run.
    pub(crate) fn begin_run(
        &self,
        allowed: impl Fn(TaskStatus) -> bool,
    ) -> Result<CancellationToken, ClientError> {
        let mut state = lock(&self.state);
        if !allowed(state.status) {
            return Err(ClientError::InvalidState {
                file_id: self.file_id.clone(),
                status: state.status,
            });
        }
        state.status = TaskStatus::Uploading;
        state.failure_reason = None;
        state.stop = None;
        state.run_token = CancellationToken::new();
        // Throughput is measured per run; a zero sample opens the window.
        self.speed.reset();
        self.speed.add_sample(0);
        Ok(state.run_token.clone())
    }

    /// Asks a running task to stop. Returns `false` if it is not running.
    pub(crate) fn request_stop(&self, request: StopRequest) -> bool {
        let mut state = lock(&self.state);
        if state.status != TaskStatus::Uploading {
            return false;
        }
        // Cancel overrides an earlier pause.
        if request == StopRequest::Cancel || state.stop.is_none() {
            state.stop = Some(request);
        }
        state.run_token.cancel();
        true
    }

    pub(crate) fn stop_request(&self) -> Option<StopRequest> {
        lock(&self.state).stop
    }

    /// Sets the status, returning the previous one.
    pub(crate) fn set_status(&self, status: TaskStatus) -> TaskStatus {
        std::mem::replace(&mut lock(&self.state).status, status)
    }

    /// Moves to `status` unless the task was cancelled meanwhile.
    pub(crate) fn settle(&self, status: TaskStatus, reason: Option<String>) -> bool {
        let mut state = lock(&self.state);
        if state.status == TaskStatus::Cancelled {
            return false;
        }
        state.status = status;
        state.failure_reason = reason;
        true
    }

    pub(crate) fn complete_with(&self, artifact: ArtifactDescriptor) -> bool {
        let mut state = lock(&self.state);
        if state.status == TaskStatus::Cancelled {
            return false;
        }
        state.status = TaskStatus::Completed;
        state.failure_reason = None;
        state.artifact = Some(artifact);
        true
    }

    // -- chunk bookkeeping --------------------------------------------------

    pub(crate) fn chunk(&self, index: u32) -> Option<ChunkDescriptor> {
        self.chunks.get(index as usize).map(|c| lock(c).clone())
    }

    /// Indices currently in `status`, ascending.
    pub(crate) fn indices_with(&self, status: ChunkStatus) -> Vec<u32> {
        self.chunks
            .iter()
            .filter_map(|c| {
                let c = lock(c);
                (c.status == status).then_some(c.index)
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn all_acked(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| lock(c).status == ChunkStatus::Acked)
    }

    pub(crate) fn mark_in_flight(&self, index: u32) {
        if let Some(c) = self.chunks.get(index as usize) {
            let mut c = lock(c);
            if c.status != ChunkStatus::Acked {
                c.status = ChunkStatus::InFlight;
            }
        }
    }

    /// Marks a chunk acknowledged; returns `true` the first time.
    pub(crate) fn mark_acked(&self, index: u32) -> bool {
        let Some(c) = self.chunks.get(index as usize) else {
            return false;
        };
        let mut c = lock(c);
        if c.status == ChunkStatus::Acked {
            return false;
        }
        c.status = ChunkStatus::Acked;
        self.acked_bytes.fetch_add(c.len, Ordering::SeqCst);
        true
    }

    /// Returns a chunk to `Pending`. `fresh_budget` resets its retries.
    pub(crate) fn mark_pending(&self, index: u32, fresh_budget: bool) {
        let Some(c) = self.chunks.get(index as usize) else {
            return;
        };
        let mut c = lock(c);
        if c.status == ChunkStatus::Acked {
            self.acked_bytes.fetch_sub(c.len, Ordering::SeqCst);
        }
        c.status = ChunkStatus::Pending;
        if fresh_budget {
            c.retry_count = 0;
        }
    }

    /// Counts a failed attempt and returns the running total.
    pub(crate) fn record_failure(&self, index: u32) -> u32 {
        let Some(c) = self.chunks.get(index as usize) else {
            return 0;
        };
        let mut c = lock(c);
        c.retry_count += 1;
        c.status = ChunkStatus::Pending;
        c.retry_count
    }

    pub(crate) fn mark_failed(&self, index: u32) {
        if let Some(c) = self.chunks.get(index as usize) {
            lock(c).status = ChunkStatus::Failed;
        }
    }

    /// Aligns chunk states with the indices the server holds.
    ///
    /// Received chunks become `Acked`, every other chunk `Pending` with a
    /// fresh retry budget. Returns the missing indices.
    pub(crate) fn apply_server_view(&self, received: &BTreeSet<u32>) -> Vec<u32> {
        let mut missing = Vec::new();
        for index in 0..self.layout.total_chunks() {
            if received.contains(&index) {
                self.mark_acked(index);
            } else {
                self.mark_pending(index, true);
                missing.push(index);
            }
        }
        missing
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn task(size: usize, chunk: u64) -> UploadTask {
        let source = Arc::new(MemorySource::new("f.bin", vec![0u8; size]));
        UploadTask::new(
            "file-1".into(),
            source,
            "f.bin".into(),
            "application/octet-stream".into(),
            None,
            ChunkLayout::new(size as u64, chunk).unwrap(),
            None,
            TaskStatus::Queued,
        )
    }

    #[test]
    fn chunk_descriptors_follow_layout() {
        let t = task(2_500_000, 1_000_000);
        let snap = t.snapshot();
        assert_eq!(snap.chunks.len(), 3);
        assert_eq!(snap.chunks[2].offset, 2_000_000);
        assert_eq!(snap.chunks[2].len, 500_000);
        assert_eq!(t.indices_with(ChunkStatus::Pending), vec![0, 1, 2]);
    }

    #[test]
    fn acked_bytes_track_transitions() {
        let t = task(2_500_000, 1_000_000);
        assert!(t.mark_acked(2));
        assert!(!t.mark_acked(2));
        assert_eq!(t.acked_bytes(), 500_000);
        t.mark_acked(0);
        assert_eq!(t.acked_bytes(), 1_500_000);
        t.mark_pending(0, true);
        assert_eq!(t.acked_bytes(), 500_000);
        assert!((t.snapshot().progress() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn server_view_wins_both_ways() {
        let t = task(50, 10);
        t.mark_acked(4);
        t.record_failure(1);
        let received: BTreeSet<u32> = [0, 1, 3].into_iter().collect();
        let missing = t.apply_server_view(&received);
        assert_eq!(missing, vec![2, 4]);
        assert_eq!(t.indices_with(ChunkStatus::Acked), vec![0, 1, 3]);
        assert_eq!(t.chunk(4).unwrap().status, ChunkStatus::Pending);
        assert_eq!(t.chunk(1).unwrap().retry_count, 1);
        assert_eq!(t.acked_bytes(), 30);
    }

    #[test]
    fn run_control() {
        let t = task(10, 10);
        assert!(!t.request_stop(StopRequest::Pause));
        let token = t.begin_run(|s| s == TaskStatus::Queued).unwrap();
        assert_eq!(t.status(), TaskStatus::Uploading);
        assert!(matches!(
            t.begin_run(|s| s == TaskStatus::Queued),
            Err(ClientError::InvalidState { .. })
        ));

        assert!(t.request_stop(StopRequest::Pause));
        assert!(token.is_cancelled());
        t.request_stop(StopRequest::Cancel);
        assert_eq!(t.stop_request(), Some(StopRequest::Cancel));
        t.request_stop(StopRequest::Pause);
        assert_eq!(t.stop_request(), Some(StopRequest::Cancel));
    }

    #[test]
    fn cancelled_tasks_stay_cancelled() {
        let t = task(10, 10);
        t.set_status(TaskStatus::Cancelled);
        assert!(!t.settle(TaskStatus::Paused, None));
        assert_eq!(t.status(), TaskStatus::Cancelled);
    }
}
