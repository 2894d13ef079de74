use crate::TransferError;

/// Byte range covered by one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

/// How a file of a given size splits into fixed-size chunks.
///
/// Every chunk is `chunk_size` bytes except the last, which holds the
/// remainder. The layout is frozen once a session exists for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    file_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkLayout {
    /// Builds the layout, rejecting empty files, zero chunk sizes and
    /// chunk counts that do not fit in a `u32`.
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if file_size == 0 {
            return Err(TransferError::InvalidLayout("file is empty".into()));
        }
        if chunk_size == 0 {
            return Err(TransferError::InvalidLayout("chunk size is zero".into()));
        }
        let total = file_size.div_ceil(chunk_size);
        let total_chunks = u32::try_from(total).map_err(|_| {
            TransferError::InvalidLayout(format!("{total} chunks exceeds the maximum"))
        })?;
        Ok(Self {
            file_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Returns the byte range of chunk `index`.
    pub fn span(&self, index: u32) -> Result<ChunkSpan, TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::IndexOutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        let offset = u64::from(index) * self.chunk_size;
        Ok(ChunkSpan {
            index,
            offset,
            len: self.chunk_size.min(self.file_size - offset),
        })
    }

    /// Expected payload length of chunk `index`, or `None` past the end.
    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        self.span(index).ok().map(|s| s.len)
    }

    /// All chunk spans in ascending index order.
    pub fn spans(&self) -> impl Iterator<Item = ChunkSpan> + '_ {
        (0..self.total_chunks).filter_map(|i| self.span(i).ok())
    }
}
