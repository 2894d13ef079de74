use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::layout::ChunkLayout;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Checks `data` against a hex SHA-256 digest (case-insensitive).
pub fn verify_checksum(data: &[u8], expected: &str) -> Result<(), TransferError> {
    let actual = checksum_bytes(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(TransferError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads arbitrary chunks of a file by index.
///
/// Chunks are read in whatever order the caller needs, so a resumed upload
/// can fetch only the indices the server is missing.
pub struct ChunkReader {
    file: Mutex<std::fs::File>,
    layout: ChunkLayout,
}

impl ChunkReader {
    /// Opens `path` and lays it out in chunks of `chunk_size` bytes.
    pub fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let layout = ChunkLayout::new(file_size, chunk_size)?;
        Ok(Self {
            file: Mutex::new(file),
            layout,
        })
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Reads chunk `index` in full.
    ///
    /// Fails with `UnexpectedEof` if the file shrank since it was opened.
    pub fn read_chunk(&self, index: u32) -> Result<Vec<u8>, TransferError> {
        let span = self.layout.span(index)?;
        let mut buf = vec![0u8; span.len as usize];
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(span.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn checksum_known_value() {
        assert_eq!(
            checksum_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn verify_checksum_accepts_uppercase() {
        let sum = checksum_bytes(b"payload").to_uppercase();
        assert!(verify_checksum(b"payload", &sum).is_ok());
    }

    #[test]
    fn verify_checksum_reports_both_digests() {
        let err = verify_checksum(b"payload", "00").unwrap_err();
        match err {
            TransferError::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, "00");
                assert_eq!(actual, checksum_bytes(b"payload"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn file_checksum_matches_bytes_checksum() {
        let dir = TempDir::new().unwrap();
        let data = pattern(20_000);
        let path = create_test_file(dir.path(), "f.bin", &data);
        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(&data));
    }

    #[test]
    fn reads_chunks_out_of_order() {
        let dir = TempDir::new().unwrap();
        let data = pattern(2500);
        let path = create_test_file(dir.path(), "f.bin", &data);
        let reader = ChunkReader::open(&path, 1000).unwrap();
        assert_eq!(reader.layout().total_chunks(), 3);

        assert_eq!(reader.read_chunk(2).unwrap(), &data[2000..]);
        assert_eq!(reader.read_chunk(0).unwrap(), &data[..1000]);
        assert_eq!(reader.read_chunk(1).unwrap(), &data[1000..2000]);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "f.bin", &pattern(100));
        let reader = ChunkReader::open(&path, 64).unwrap();
        assert!(matches!(
            reader.read_chunk(2),
            Err(TransferError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn truncated_file_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "f.bin", &pattern(100));
        let reader = ChunkReader::open(&path, 64).unwrap();
        std::fs::write(&path, pattern(70)).unwrap();
        assert!(matches!(reader.read_chunk(1), Err(TransferError::Io(_))));
    }

    #[test]
    fn empty_file_has_no_layout() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "empty.bin", &[]);
        assert!(matches!(
            ChunkReader::open(&path, 64),
            Err(TransferError::InvalidLayout(_))
        ));
    }
}
