//! Drives upload tasks: session creation, bounded chunk dispatch, retries,
//! completion and pause/resume/cancel.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chunkline_protocol::{
    ArtifactDescriptor, ChunkTarget, ErrorKind, UploadChunkRequest, UploadChunkResponse,
};
use chunkline_transfer::{ChunkLayout, ChunkSpan, checksum_bytes, validate_file_name};

use crate::error::ClientError;
use crate::reconcile::reconcile;
use crate::registry::TaskRegistry;
use crate::source::ChunkSource;
use crate::task::{StopRequest, UploadTask};
use crate::transport::UploadTransport;
use crate::types::{
    ChunkStatus, OrchestratorConfig, TaskOutcome, TaskStatus, UploadEvent, UploadOptions,
};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Why a run stopped short of an artifact.
enum Halt {
    /// The run token fired (pause or cancel).
    Stopped,
    Error(ClientError),
}

impl From<ClientError> for Halt {
    fn from(e: ClientError) -> Self {
        Halt::Error(e)
    }
}

/// How a single chunk's transfer ended.
enum ChunkResult {
    Acked(UploadChunkResponse),
    /// Retry budget used up; carries the last error.
    Exhausted(ClientError),
    /// Terminal for the whole run.
    Fatal(ClientError),
    Aborted,
}

/// Uploads files in chunks over an [`UploadTransport`].
///
/// Tasks live in the orchestrator's own [`TaskRegistry`]. `run` and
/// `resume` drive a task to its next resting state; `pause` and `cancel`
/// may be called concurrently from elsewhere.
pub struct Orchestrator {
    transport: Arc<dyn UploadTransport>,
    registry: TaskRegistry,
    config: OrchestratorConfig,
    events: broadcast::Sender<UploadEvent>,
    observed_throughput: Mutex<Option<f64>>,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        registry: TaskRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            transport,
            registry,
            config,
            events,
            observed_throughput: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn task(&self, file_id: &str) -> Option<Arc<UploadTask>> {
        self.registry.get(file_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Throughput of the last completed upload, in bytes per second.
    pub fn observed_throughput(&self) -> Option<f64> {
        *self
            .observed_throughput
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new upload. The chunk size is fixed here for the life of
    /// the task.
    pub fn enqueue(
        &self,
        source: Arc<dyn ChunkSource>,
        options: UploadOptions,
    ) -> Result<String, ClientError> {
        self.register(source, options, None, TaskStatus::Queued)
    }

    /// Registers a task for a session created by an earlier process.
    ///
    /// The task starts `Paused`; call [`resume`](Self::resume) to continue
    /// it. `options.chunk_size` must match the session's chunk size.
    pub fn adopt(
        &self,
        source: Arc<dyn ChunkSource>,
        options: UploadOptions,
        upload_id: impl Into<String>,
    ) -> Result<String, ClientError> {
        self.register(source, options, Some(upload_id.into()), TaskStatus::Paused)
    }

    fn register(
        &self,
        source: Arc<dyn ChunkSource>,
        options: UploadOptions,
        upload_id: Option<String>,
        status: TaskStatus,
    ) -> Result<String, ClientError> {
        let file_name = options
            .file_name
            .unwrap_or_else(|| source.name().to_string());
        validate_file_name(&file_name)?;

        let chunk_size = match options.chunk_size {
            Some(size) => size,
            None => self.config.chunk_size.chunk_size(self.observed_throughput()),
        };
        let layout = ChunkLayout::new(source.size(), chunk_size)?;
        let file_id = Uuid::new_v4().to_string();

        let task = Arc::new(UploadTask::new(
            file_id.clone(),
            source,
            file_name,
            options
                .mime_type
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            options.workspace_context,
            layout,
            upload_id,
            status,
        ));

        info!(
            file_id = %file_id,
            file_name = %task.file_name(),
            size = layout.file_size(),
            chunk_size = layout.chunk_size(),
            chunks = layout.total_chunks(),
            upload_id = ?task.upload_id(),
            "registered upload task"
        );

        self.registry.insert(task);
        self.emit_status(&file_id, status);
        Ok(file_id)
    }

    /// Uploads a queued task until it completes, is paused or cancelled,
    /// or fails.
    pub async fn run(&self, file_id: &str) -> Result<TaskOutcome, ClientError> {
        let task = self.require(file_id)?;
        let token = task.begin_run(|s| s == TaskStatus::Queued)?;
        self.emit_status(file_id, TaskStatus::Uploading);
        let result = self.drive(&task, &token, false).await;
        self.finish(&task, result)
    }

    /// Continues a paused or failed task from what the server holds.
    pub async fn resume(&self, file_id: &str) -> Result<TaskOutcome, ClientError> {
        let task = self.require(file_id)?;
        let token = task.begin_run(TaskStatus::is_resumable)?;
        self.emit_status(file_id, TaskStatus::Uploading);
        let result = self.drive(&task, &token, true).await;
        self.finish(&task, result)
    }

    /// Stops dispatching chunks and aborts in-flight attempts.
    ///
    /// Returns once the request is recorded; the running `run`/`resume`
    /// call returns [`TaskOutcome::Paused`] shortly after.
    pub fn pause(&self, file_id: &str) -> Result<(), ClientError> {
        let task = self.require(file_id)?;
        if task.request_stop(StopRequest::Pause) {
            info!(file_id, "pause requested");
            return Ok(());
        }
        match task.status() {
            TaskStatus::Paused => Ok(()),
            TaskStatus::Queued => {
                task.set_status(TaskStatus::Paused);
                self.emit_status(file_id, TaskStatus::Paused);
                Ok(())
            }
            status => Err(ClientError::InvalidState {
                file_id: file_id.to_string(),
                status,
            }),
        }
    }

    /// Aborts the task and discards its server session.
    ///
    /// A failing server-side cancel is logged; the task is cancelled either
    /// way and the orphaned session expires on the server.
    pub async fn cancel(&self, file_id: &str) -> Result<(), ClientError> {
        let task = self.require(file_id)?;
        match task.status() {
            TaskStatus::Cancelled => return Ok(()),
            TaskStatus::Completed => {
                return Err(ClientError::InvalidState {
                    file_id: file_id.to_string(),
                    status: TaskStatus::Completed,
                });
            }
            _ => {}
        }

        task.request_stop(StopRequest::Cancel);
        task.set_status(TaskStatus::Cancelled);

        if let Some(upload_id) = task.upload_id() {
            match self.transport.cancel(&upload_id).await {
                Ok(()) => debug!(file_id, upload_id = %upload_id, "server session cancelled"),
                Err(e) if e.kind() == Some(ErrorKind::NotFound) => {
                    debug!(file_id, upload_id = %upload_id, "server session already gone")
                }
                Err(e) => warn!(
                    file_id,
                    upload_id = %upload_id,
                    "server cancel failed, session will expire: {e}"
                ),
            }
        }

        info!(file_id, "upload cancelled");
        self.emit_status(file_id, TaskStatus::Cancelled);
        Ok(())
    }

    fn require(&self, file_id: &str) -> Result<Arc<UploadTask>, ClientError> {
        self.registry
            .get(file_id)
            .ok_or_else(|| ClientError::UnknownTask(file_id.to_string()))
    }

    // -- run ------------------------------------------------------------------

    async fn drive(
        &self,
        task: &UploadTask,
        token: &CancellationToken,
        reconcile_first: bool,
    ) -> Result<ArtifactDescriptor, Halt> {
        if reconcile_first {
            let plan = self
                .retrying(task, token, "status", || {
                    reconcile(task, self.transport.as_ref())
                })
                .await?;
            info!(
                file_id = %task.file_id(),
                missing = plan.missing.len(),
                server_state = ?plan.server_state,
                "resuming upload"
            );
            self.emit_progress(task);
        }

        let slots = Semaphore::new(self.config.max_concurrent_chunks.max(1));
        let mut rounds = 0;

        loop {
            if task.upload_id().is_none() {
                self.open_session(task, &slots, token).await?;
            }
            self.transfer_pending(task, &slots, token).await?;

            let upload_id = task
                .upload_id()
                .ok_or_else(|| ClientError::Protocol("no upload session".into()))?;

            let err = match self
                .retrying(task, token, "complete", || self.transport.complete(&upload_id))
                .await
            {
                Ok(artifact) => return Ok(artifact),
                Err(Halt::Error(e)) if e.missing_chunks().is_some() => e,
                Err(other) => return Err(other),
            };

            rounds += 1;
            if rounds > self.config.max_reconcile_rounds {
                return Err(Halt::Error(err));
            }
            warn!(
                file_id = %task.file_id(),
                upload_id = %upload_id,
                round = rounds,
                reported = ?err.missing_chunks().unwrap_or_default(),
                "server reported missing chunks, reconciling"
            );
            // The status answer is fresher than the error's list.
            let plan = self
                .retrying(task, token, "status", || {
                    reconcile(task, self.transport.as_ref())
                })
                .await?;
            debug!(file_id = %task.file_id(), missing = ?plan.missing, "re-sending chunks");
            self.emit_progress(task);
        }
    }

    /// Sends the lowest pending chunk as a new-session request and binds the
    /// task to the session the server creates.
    async fn open_session(
        &self,
        task: &UploadTask,
        slots: &Semaphore,
        token: &CancellationToken,
    ) -> Result<(), Halt> {
        let Some(&index) = task.indices_with(ChunkStatus::Pending).first() else {
            return Err(ClientError::Protocol("no pending chunk to open a session with".into()).into());
        };
        let layout = task.layout();
        let target = ChunkTarget::NewSession {
            file_name: task.file_name().to_string(),
            file_size: layout.file_size(),
            mime_type: task.mime_type().to_string(),
            chunk_size: layout.chunk_size(),
            total_chunks: layout.total_chunks(),
            workspace_context: task.workspace_context().map(str::to_string),
        };

        match self.transfer_chunk(task, index, &target, slots, token).await {
            ChunkResult::Acked(resp) => {
                info!(
                    file_id = %task.file_id(),
                    upload_id = %resp.upload_id,
                    "upload session created"
                );
                task.set_upload_id(resp.upload_id);
                Ok(())
            }
            ChunkResult::Exhausted(e) => {
                task.mark_failed(index);
                Err(ClientError::RetriesExhausted {
                    failed: vec![index],
                    last_error: e.to_string(),
                }
                .into())
            }
            ChunkResult::Fatal(e) => Err(e.into()),
            ChunkResult::Aborted => Err(Halt::Stopped),
        }
    }

    /// Transfers every pending chunk of a task with an open session.
    ///
    /// A chunk that runs out of retries is marked `Failed` while its
    /// siblings carry on; a fatal error aborts the siblings.
    async fn transfer_pending(
        &self,
        task: &UploadTask,
        slots: &Semaphore,
        token: &CancellationToken,
    ) -> Result<(), Halt> {
        let upload_id = task
            .upload_id()
            .ok_or_else(|| ClientError::Protocol("no upload session".into()))?;
        let target = ChunkTarget::ExistingSession { upload_id };
        let abort = token.child_token();

        let target = &target;
        let abort_ref = &abort;
        let mut transfers: FuturesUnordered<_> = task
            .indices_with(ChunkStatus::Pending)
            .into_iter()
            .map(|index| async move {
                let result = self
                    .transfer_chunk(task, index, target, slots, abort_ref)
                    .await;
                (index, result)
            })
            .collect();

        let mut fatal = None;
        let mut exhausted = Vec::new();
        let mut last_error = String::new();

        while let Some((index, result)) = transfers.next().await {
            match result {
                ChunkResult::Acked(_) | ChunkResult::Aborted => {}
                ChunkResult::Exhausted(e) => {
                    task.mark_failed(index);
                    exhausted.push(index);
                    last_error = e.to_string();
                }
                ChunkResult::Fatal(e) => {
                    if fatal.is_none() {
                        abort.cancel();
                        fatal = Some(e);
                    }
                }
            }
        }

        if token.is_cancelled() {
            return Err(Halt::Stopped);
        }
        if let Some(e) = fatal {
            return Err(e.into());
        }
        if !exhausted.is_empty() {
            exhausted.sort_unstable();
            return Err(ClientError::RetriesExhausted {
                failed: exhausted,
                last_error,
            }
            .into());
        }
        Ok(())
    }

    /// Sends one chunk until it is acknowledged, its retries run out, it
    /// hits a terminal error or `cancel` fires.
    async fn transfer_chunk(
        &self,
        task: &UploadTask,
        index: u32,
        target: &ChunkTarget,
        slots: &Semaphore,
        cancel: &CancellationToken,
    ) -> ChunkResult {
        let span = match task.layout().span(index) {
            Ok(span) => span,
            Err(e) => return ChunkResult::Fatal(e.into()),
        };
        let policy = &self.config.retry;

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => return ChunkResult::Aborted,
                permit = slots.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return ChunkResult::Aborted,
                },
            };

            task.mark_in_flight(index);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.attempt(task, span, target) => Some(result),
            };
            drop(permit);

            let err = match outcome {
                None => {
                    task.mark_pending(index, false);
                    return ChunkResult::Aborted;
                }
                Some(Ok(resp)) => {
                    if task.mark_acked(index) {
                        task.speed().add_sample(span.len);
                        self.emit_progress(task);
                    }
                    trace!(
                        file_id = %task.file_id(),
                        chunk_index = index,
                        received = resp.received_count,
                        total = resp.total_count,
                        "chunk acknowledged"
                    );
                    return ChunkResult::Acked(resp);
                }
                Some(Err(e)) => e,
            };

            let Some(class) = err.failure_class() else {
                task.mark_pending(index, false);
                return ChunkResult::Fatal(err);
            };

            let attempt = task.record_failure(index);
            if !policy.allows_retry(attempt) {
                warn!(
                    file_id = %task.file_id(),
                    chunk_index = index,
                    attempts = attempt,
                    "chunk failed after exhausting retries: {err}"
                );
                return ChunkResult::Exhausted(err);
            }

            let delay = policy.delay_for(class, attempt);
            warn!(
                file_id = %task.file_id(),
                chunk_index = index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "chunk attempt failed, retrying: {err}"
            );
            self.emit(UploadEvent::ChunkRetry {
                file_id: task.file_id().to_string(),
                chunk_index: index,
                attempt,
                delay,
                error: err.to_string(),
            });

            tokio::select! {
                _ = cancel.cancelled() => return ChunkResult::Aborted,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        task: &UploadTask,
        span: ChunkSpan,
        target: &ChunkTarget,
    ) -> Result<UploadChunkResponse, ClientError> {
        let payload = task.source().read_chunk(task.layout(), span).await?;
        let checksum = self
            .config
            .send_checksums
            .then(|| checksum_bytes(&payload));
        let req = UploadChunkRequest {
            target: target.clone(),
            chunk_index: span.index,
            checksum,
            payload,
        };

        match tokio::time::timeout(self.config.attempt_timeout, self.transport.upload_chunk(req))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Runs a session-level request with the retry policy.
    async fn retrying<T, F, Fut>(
        &self,
        task: &UploadTask,
        cancel: &CancellationToken,
        op: &str,
        mut call: F,
    ) -> Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Halt::Stopped),
                result = call() => result,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let class = match err.failure_class() {
                Some(class) if policy.allows_retry(attempt) => class,
                _ => return Err(Halt::Error(err)),
            };

            let delay = policy.delay_for(class, attempt);
            warn!(
                file_id = %task.file_id(),
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "request failed, retrying: {err}"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Halt::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Settles the task after a run and reports the outcome.
    fn finish(
        &self,
        task: &UploadTask,
        result: Result<ArtifactDescriptor, Halt>,
    ) -> Result<TaskOutcome, ClientError> {
        let file_id = task.file_id();
        match result {
            Ok(artifact) => {
                for index in 0..task.layout().total_chunks() {
                    task.mark_acked(index);
                }
                if !task.complete_with(artifact.clone()) {
                    return Ok(TaskOutcome::Cancelled);
                }
                let bps = task.speed().bytes_per_second();
                if bps > 0.0 {
                    *self
                        .observed_throughput
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(bps);
                }
                info!(
                    file_id,
                    artifact_id = %artifact.id,
                    size = artifact.size,
                    storage_key = %artifact.storage_key,
                    "upload completed"
                );
                self.emit_progress(task);
                self.emit_status(file_id, TaskStatus::Completed);
                self.emit(UploadEvent::Completed {
                    file_id: file_id.to_string(),
                    artifact: artifact.clone(),
                });
                Ok(TaskOutcome::Completed(artifact))
            }
            Err(halt) => {
                if task.stop_request() == Some(StopRequest::Cancel) {
                    return Ok(TaskOutcome::Cancelled);
                }
                match halt {
                    Halt::Stopped => {
                        if !task.settle(TaskStatus::Paused, None) {
                            return Ok(TaskOutcome::Cancelled);
                        }
                        info!(
                            file_id,
                            acked_bytes = task.acked_bytes(),
                            upload_id = ?task.upload_id(),
                            "upload paused"
                        );
                        self.emit_status(file_id, TaskStatus::Paused);
                        Ok(TaskOutcome::Paused)
                    }
                    Halt::Error(e) => {
                        let reason = e.actionable_reason();
                        if task.settle(TaskStatus::Failed, Some(reason.clone())) {
                            warn!(file_id, upload_id = ?task.upload_id(), "upload failed: {reason}");
                            self.emit_status(file_id, TaskStatus::Failed);
                            self.emit(UploadEvent::Failed {
                                file_id: file_id.to_string(),
                                reason,
                            });
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    // -- events ---------------------------------------------------------------

    fn emit(&self, event: UploadEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_status(&self, file_id: &str, status: TaskStatus) {
        self.emit(UploadEvent::StatusChanged {
            file_id: file_id.to_string(),
            status,
        });
    }

    fn emit_progress(&self, task: &UploadTask) {
        let acked_bytes = task.acked_bytes();
        let total_bytes = task.layout().file_size();
        self.emit(UploadEvent::Progress {
            file_id: task.file_id().to_string(),
            acked_bytes,
            total_bytes,
            percentage: acked_bytes as f64 / total_bytes as f64 * 100.0,
            bytes_per_second: task.speed().bytes_per_second(),
        });
    }
}
