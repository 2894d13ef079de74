//! Server side of the chunkline upload engine.
//!
//! [`SessionStore`] tracks which chunks of each upload have arrived and
//! stages their bytes; [`Assembler`] turns a fully received session into a
//! single artifact in [`BlobStorage`]. [`UploadService`] wires both behind
//! the four protocol operations so transports only translate frames.

pub mod assembler;
pub mod config;
pub mod error;
pub mod identity;
pub mod service;
pub mod session;
pub mod sink;
pub mod staging;
pub mod storage;
pub mod store;
pub mod sweeper;

pub use assembler::Assembler;
pub use config::{StoreConfig, SweeperConfig};
pub use error::{StorageError, UploadError};
pub use identity::{CallerIdentity, IdentityProvider, StaticTokenProvider};
pub use service::UploadService;
pub use session::{NewSession, UploadSession};
pub use sink::{ArtifactRecord, ArtifactSink, JsonLinesSink, MemoryArtifactSink};
pub use staging::{ChunkStaging, FsChunkStaging, MemoryChunkStaging};
pub use storage::{BlobStorage, FsBlobStorage, MemoryBlobStorage};
pub use store::SessionStore;
pub use sweeper::spawn_sweeper;
