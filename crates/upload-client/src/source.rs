//! Where chunk bytes come from.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chunkline_transfer::{ChunkLayout, ChunkReader, ChunkSpan, TransferError};
use futures_util::future::BoxFuture;

use crate::error::ClientError;

/// A readable payload of known size.
pub trait ChunkSource: Send + Sync {
    /// Name used for the uploaded file unless the options override it.
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Reads the bytes of one chunk of `layout`.
    fn read_chunk<'a>(
        &'a self,
        layout: &'a ChunkLayout,
        span: ChunkSpan,
    ) -> BoxFuture<'a, Result<Vec<u8>, ClientError>>;
}

/// Reads chunks from a file on disk.
///
/// The file is opened on the first read; reads run on the blocking pool.
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
    reader: Mutex<Option<Arc<ChunkReader>>>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref().to_path_buf();
        let size = std::fs::metadata(&path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?;
        Ok(Self {
            path,
            name,
            size,
            reader: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cached_reader(&self, layout: &ChunkLayout) -> Option<Arc<ChunkReader>> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|r| r.layout() == layout)
            .cloned()
    }
}

impl ChunkSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_chunk<'a>(
        &'a self,
        layout: &'a ChunkLayout,
        span: ChunkSpan,
    ) -> BoxFuture<'a, Result<Vec<u8>, ClientError>> {
        Box::pin(async move {
            let reader = match self.cached_reader(layout) {
                Some(reader) => reader,
                None => {
                    let path = self.path.clone();
                    let chunk_size = layout.chunk_size();
                    let reader = tokio::task::spawn_blocking(move || {
                        ChunkReader::open(&path, chunk_size)
                    })
                    .await
                    .map_err(|e| ClientError::Io(std::io::Error::other(e)))??;
                    if reader.layout() != layout {
                        return Err(TransferError::InvalidLayout(format!(
                            "{} changed size since the upload started",
                            self.path.display()
                        ))
                        .into());
                    }
                    let reader = Arc::new(reader);
                    *self.reader.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(Arc::clone(&reader));
                    reader
                }
            };

            let data = tokio::task::spawn_blocking(move || reader.read_chunk(span.index))
                .await
                .map_err(|e| ClientError::Io(std::io::Error::other(e)))??;
            Ok(data)
        })
    }
}

/// In-memory payload.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(data.into()),
        }
    }
}

impl ChunkSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_chunk<'a>(
        &'a self,
        _layout: &'a ChunkLayout,
        span: ChunkSpan,
    ) -> BoxFuture<'a, Result<Vec<u8>, ClientError>> {
        let start = span.offset as usize;
        let end = start.saturating_add(span.len as usize);
        let result = self
            .data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("chunk {} beyond end of {}", span.index, self.name),
                ))
            });
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_source_reads_any_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.bin");
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let source = FileSource::open(&path).unwrap();
        assert_eq!(source.name(), "clip.bin");
        assert_eq!(source.size(), 2500);

        let layout = ChunkLayout::new(2500, 1000).unwrap();
        let last = source
            .read_chunk(&layout, layout.span(2).unwrap())
            .await
            .unwrap();
        assert_eq!(last, &data[2000..]);
        let first = source
            .read_chunk(&layout, layout.span(0).unwrap())
            .await
            .unwrap();
        assert_eq!(first, &data[..1000]);
    }

    #[tokio::test]
    async fn file_source_detects_changed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grow.bin");
        std::fs::write(&path, vec![1u8; 100]).unwrap();
        let source = FileSource::open(&path).unwrap();
        std::fs::write(&path, vec![1u8; 150]).unwrap();

        let layout = ChunkLayout::new(source.size(), 50).unwrap();
        let err = source
            .read_chunk(&layout, layout.span(0).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transfer(_)));
    }

    #[test]
    fn file_source_requires_existing_file() {
        assert!(matches!(
            FileSource::open("/definitely/not/here.bin"),
            Err(ClientError::Io(_))
        ));
    }

    #[tokio::test]
    async fn memory_source_slices() {
        let source = MemorySource::new("m.bin", vec![0u8, 1, 2, 3, 4]);
        let layout = ChunkLayout::new(5, 2).unwrap();
        let last = source
            .read_chunk(&layout, layout.span(2).unwrap())
            .await
            .unwrap();
        assert_eq!(last, vec![4]);
    }
}
