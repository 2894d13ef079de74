use std::fmt;
use std::time::Duration;

use chunkline_protocol::ArtifactDescriptor;
use chunkline_transfer::DEFAULT_CHUNK_SIZE;

use crate::retry::RetryPolicy;

/// Lifecycle of a client upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Queued,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// User-visible label.
    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Tasks in these states continue through `resume`.
    pub fn is_resumable(self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Transfer state of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Acked,
    Failed,
}

/// One chunk of a task and its transfer bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
    pub status: ChunkStatus,
    /// Failed attempts since the chunk was last (re)queued.
    pub retry_count: u32,
}

/// Per-upload options given to `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Overrides the source's name.
    pub file_name: Option<String>,
    /// Defaults to `application/octet-stream`.
    pub mime_type: Option<String>,
    pub workspace_context: Option<String>,
    /// Overrides the orchestrator's chunk size policy. Required to match
    /// the original chunk size when adopting an existing session.
    pub chunk_size: Option<u64>,
}

/// How chunk sizes are chosen for new uploads.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkSizePolicy {
    Fixed(u64),
    /// Sizes chunks so one takes about `target` to transfer at the
    /// throughput observed on earlier uploads, clamped to `[min, max]`.
    Adaptive {
        min: u64,
        max: u64,
        target: Duration,
    },
}

impl Default for ChunkSizePolicy {
    fn default() -> Self {
        ChunkSizePolicy::Fixed(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkSizePolicy {
    /// Chunk size for a new upload given the last observed throughput.
    pub fn chunk_size(&self, observed_bytes_per_second: Option<f64>) -> u64 {
        match *self {
            ChunkSizePolicy::Fixed(size) => size.max(1),
            ChunkSizePolicy::Adaptive { min, max, target } => {
                let min = min.max(1);
                let max = max.max(min);
                let wanted = match observed_bytes_per_second {
                    Some(bps) if bps.is_finite() && bps > 0.0 => {
                        (bps * target.as_secs_f64()) as u64
                    }
                    _ => DEFAULT_CHUNK_SIZE,
                };
                wanted.clamp(min, max)
            }
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// In-flight chunk transfers per task.
    pub max_concurrent_chunks: usize,
    pub attempt_timeout: Duration,
    /// `complete` attempts answered with `IncompleteUpload` before the
    /// task fails.
    pub max_reconcile_rounds: u32,
    pub chunk_size: ChunkSizePolicy,
    pub retry: RetryPolicy,
    /// Attach a SHA-256 checksum to every chunk.
    pub send_checksums: bool,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 4,
            attempt_timeout: Duration::from_secs(120),
            max_reconcile_rounds: 3,
            chunk_size: ChunkSizePolicy::default(),
            retry: RetryPolicy::default(),
            send_checksums: true,
            event_capacity: 256,
        }
    }
}

/// How a run of a task ended, short of an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(ArtifactDescriptor),
    Paused,
    Cancelled,
}

/// Events published by the orchestrator.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    StatusChanged {
        file_id: String,
        status: TaskStatus,
    },
    Progress {
        file_id: String,
        acked_bytes: u64,
        total_bytes: u64,
        percentage: f64,
        bytes_per_second: f64,
    },
    ChunkRetry {
        file_id: String,
        chunk_index: u32,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Completed {
        file_id: String,
        artifact: ArtifactDescriptor,
    },
    Failed {
        file_id: String,
        reason: String,
    },
}

impl UploadEvent {
    pub fn file_id(&self) -> &str {
        match self {
            UploadEvent::StatusChanged { file_id, .. }
            | UploadEvent::Progress { file_id, .. }
            | UploadEvent::ChunkRetry { file_id, .. }
            | UploadEvent::Completed { file_id, .. }
            | UploadEvent::Failed { file_id, .. } => file_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels() {
        assert_eq!(TaskStatus::Queued.label(), "queued");
        assert_eq!(TaskStatus::Uploading.to_string(), "uploading");
        assert_eq!(TaskStatus::Failed.label(), "failed");
        assert!(TaskStatus::Failed.is_resumable());
        assert!(TaskStatus::Paused.is_resumable());
        assert!(!TaskStatus::Completed.is_resumable());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn fixed_policy_ignores_throughput() {
        let policy = ChunkSizePolicy::Fixed(1_000_000);
        assert_eq!(policy.chunk_size(None), 1_000_000);
        assert_eq!(policy.chunk_size(Some(1e9)), 1_000_000);
    }

    #[test]
    fn adaptive_policy_clamps() {
        let policy = ChunkSizePolicy::Adaptive {
            min: 256 * 1024,
            max: 16 * 1024 * 1024,
            target: Duration::from_secs(2),
        };
        assert_eq!(policy.chunk_size(None), DEFAULT_CHUNK_SIZE);
        assert_eq!(policy.chunk_size(Some(1_000_000.0)), 2_000_000);
        assert_eq!(policy.chunk_size(Some(10.0)), 256 * 1024);
        assert_eq!(policy.chunk_size(Some(1e12)), 16 * 1024 * 1024);
        assert_eq!(policy.chunk_size(Some(f64::NAN)), DEFAULT_CHUNK_SIZE);
    }
}
