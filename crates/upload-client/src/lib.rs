//! Client side of the chunkline upload engine.
//!
//! An [`Orchestrator`] splits files into chunks, sends them with bounded
//! concurrency and per-class retry backoff, and completes the upload once
//! the server holds every chunk. Interrupted uploads resume through the
//! [`reconcile`] step, which trusts the server's view of received chunks.

pub mod error;
pub mod orchestrator;
pub(crate) mod pumps;
pub mod reconcile;
mod registry;
pub mod retry;
pub mod source;
pub mod task;
pub mod transport;
pub mod types;
pub mod ws_client;

pub use error::ClientError;
pub use orchestrator::Orchestrator;
pub use reconcile::{ReconcilePlan, reconcile};
pub use registry::TaskRegistry;
pub use retry::{Backoff, FailureClass, RetryPolicy};
pub use source::{ChunkSource, FileSource, MemorySource};
pub use task::{TaskSnapshot, UploadTask};
pub use transport::UploadTransport;
pub use types::{
    ChunkDescriptor, ChunkSizePolicy, ChunkStatus, OrchestratorConfig, TaskOutcome, TaskStatus,
    UploadEvent, UploadOptions,
};
pub use ws_client::{WsClient, WsTransport};
