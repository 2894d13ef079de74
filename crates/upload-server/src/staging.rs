//! Staging area for received chunks and session manifests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;
use crate::session::UploadSession;

const MANIFEST_FILE: &str = "session.json";
const CHUNK_EXT: &str = "chunk";

/// Holds chunk bytes until assembly and the manifest of every session.
///
/// Chunk writes are all-or-nothing: a reader never observes a partially
/// written chunk, and writing an index again replaces it.
pub trait ChunkStaging: Send + Sync {
    fn put_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    fn read_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
    ) -> BoxFuture<'a, Result<Vec<u8>, StorageError>>;

    fn has_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Deletes every staged chunk of a session, keeping its manifest.
    fn delete_chunks<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;

    fn save_manifest<'a>(
        &'a self,
        session: &'a UploadSession,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Loads every readable manifest. Unreadable ones are skipped.
    fn load_manifests(&self) -> BoxFuture<'_, Result<Vec<UploadSession>, StorageError>>;

    /// Removes a session's manifest and chunks.
    fn remove_session<'a>(&'a self, upload_id: &'a str)
    -> BoxFuture<'a, Result<(), StorageError>>;
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// One directory per session: `<root>/<upload_id>/{session.json,<index>.chunk}`.
pub struct FsChunkStaging {
    root: PathBuf,
}

impl FsChunkStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        let plain = !upload_id.is_empty()
            && !upload_id.starts_with('.')
            && upload_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !plain {
            return Err(StorageError::InvalidKey(upload_id.to_string()));
        }
        Ok(self.root.join(upload_id))
    }

    fn chunk_path(&self, upload_id: &str, index: u32) -> Result<PathBuf, StorageError> {
        Ok(self
            .session_dir(upload_id)?
            .join(format!("{index}.{CHUNK_EXT}")))
    }
}

/// Writes `data` to a temp file next to `path`, then renames it into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    Ok(result?)
}

impl ChunkStaging for FsChunkStaging {
    fn put_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.chunk_path(upload_id, index)?;
            write_atomic(&path, data).await
        })
    }

    fn read_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
    ) -> BoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(async move {
            let path = self.chunk_path(upload_id, index)?;
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                    StorageError::NotFound(format!("chunk {index} of {upload_id}")),
                ),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn has_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            let path = self.chunk_path(upload_id, index)?;
            Ok(tokio::fs::try_exists(&path).await?)
        })
    }

    fn delete_chunks<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let dir = self.session_dir(upload_id)?;
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_chunk = path.extension().is_some_and(|ext| ext == CHUNK_EXT);
                let is_tmp = path.extension().is_some_and(|ext| ext == "tmp");
                if is_chunk || is_tmp {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(())
        })
    }

    fn save_manifest<'a>(
        &'a self,
        session: &'a UploadSession,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.session_dir(&session.upload_id)?.join(MANIFEST_FILE);
            let json = serde_json::to_vec_pretty(session)?;
            write_atomic(&path, &json).await
        })
    }

    fn load_manifests(&self) -> BoxFuture<'_, Result<Vec<UploadSession>, StorageError>> {
        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(&self.root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut sessions = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let path = entry.path().join(MANIFEST_FILE);
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "skipping unreadable manifest: {e}");
                        continue;
                    }
                };
                match serde_json::from_slice::<UploadSession>(&bytes) {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "skipping corrupt manifest: {e}");
                    }
                }
            }
            Ok(sessions)
        })
    }

    fn remove_session<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let dir = self.session_dir(upload_id)?;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StagedSession {
    chunks: BTreeMap<u32, Vec<u8>>,
    manifest: Option<UploadSession>,
}

/// Non-durable staging for tests and ephemeral servers.
#[derive(Default)]
pub struct MemoryChunkStaging {
    sessions: Mutex<HashMap<String, StagedSession>>,
}

impl MemoryChunkStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks currently staged for `upload_id`.
    pub fn staged_chunks(&self, upload_id: &str) -> usize {
        self.lock()
            .get(upload_id)
            .map_or(0, |s| s.chunks.len())
    }

    /// Returns the last saved manifest of `upload_id`.
    pub fn manifest(&self, upload_id: &str) -> Option<UploadSession> {
        self.lock()
            .get(upload_id)
            .and_then(|s| s.manifest.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StagedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChunkStaging for MemoryChunkStaging {
    fn put_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.lock()
                .entry(upload_id.to_string())
                .or_default()
                .chunks
                .insert(index, data.to_vec());
            Ok(())
        })
    }

    fn read_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
    ) -> BoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(async move {
            self.lock()
                .get(upload_id)
                .and_then(|s| s.chunks.get(&index).cloned())
                .ok_or_else(|| StorageError::NotFound(format!("chunk {index} of {upload_id}")))
        })
    }

    fn has_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        index: u32,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .get(upload_id)
                .is_some_and(|s| s.chunks.contains_key(&index)))
        })
    }

    fn delete_chunks<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            if let Some(s) = self.lock().get_mut(upload_id) {
                s.chunks.clear();
            }
            Ok(())
        })
    }

    fn save_manifest<'a>(
        &'a self,
        session: &'a UploadSession,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.lock()
                .entry(session.upload_id.clone())
                .or_default()
                .manifest = Some(session.clone());
            Ok(())
        })
    }

    fn load_manifests(&self) -> BoxFuture<'_, Result<Vec<UploadSession>, StorageError>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .values()
                .filter_map(|s| s.manifest.clone())
                .collect())
        })
    }

    fn remove_session<'a>(
        &'a self,
        upload_id: &'a str,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.lock().remove(upload_id);
            Ok(())
        })
    }
}
