//! Final artifact storage.
//!
//! The durable backend is an external collaborator; this module defines the
//! narrow interface the assembler needs plus a filesystem and an in-memory
//! implementation.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::StorageError;

/// Stream of byte blocks written into one object, in order.
pub type ByteStream<'a> = BoxStream<'a, Result<Vec<u8>, StorageError>>;

/// Reader over a stored object.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Key/value object storage for assembled artifacts.
pub trait BlobStorage: Send + Sync {
    /// Writes the whole stream under `key` and returns the number of bytes
    /// stored. The object becomes visible only once fully written.
    fn write<'a>(
        &'a self,
        key: &'a str,
        data: ByteStream<'a>,
    ) -> BoxFuture<'a, Result<u64, StorageError>>;

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<BlobReader, StorageError>>;

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Deletes `key`. Deleting a missing object is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Stores objects as files below a root directory.
pub struct FsBlobStorage {
    root: PathBuf,
}

impl FsBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        let plain = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    async fn write_file(&self, key: &str, mut data: ByteStream<'_>) -> Result<u64, StorageError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut written = 0u64;
            while let Some(block) = data.next().await {
                let block = block?;
                file.write_all(&block).await?;
                written += block.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, StorageError>(written)
        }
        .await;

        match result {
            Ok(written) => {
                tokio::fs::rename(&tmp, &path).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }
}

impl BlobStorage for FsBlobStorage {
    fn write<'a>(
        &'a self,
        key: &'a str,
        data: ByteStream<'a>,
    ) -> BoxFuture<'a, Result<u64, StorageError>> {
        Box::pin(self.write_file(key, data))
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<BlobReader, StorageError>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::File::open(&path).await {
                Ok(file) => Ok(Box::pin(file) as BlobReader),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(StorageError::NotFound(key.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            Ok(tokio::fs::try_exists(&path).await?)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
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

/// Keeps objects in a map. Used in tests and for throwaway servers.
#[derive(Default)]
pub struct MemoryBlobStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the object stored under `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn write<'a>(
        &'a self,
        key: &'a str,
        mut data: ByteStream<'a>,
    ) -> BoxFuture<'a, Result<u64, StorageError>> {
        Box::pin(async move {
            let mut object = Vec::new();
            while let Some(block) = data.next().await {
                object.extend_from_slice(&block?);
            }
            let written = object.len() as u64;
            self.lock().insert(key.to_string(), object);
            Ok(written)
        })
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<BlobReader, StorageError>> {
        Box::pin(async move {
            let object = self
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            Ok(Box::pin(std::io::Cursor::new(object)) as BlobReader)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move { Ok(self.lock().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.lock().remove(key);
            Ok(())
        })
    }
}
