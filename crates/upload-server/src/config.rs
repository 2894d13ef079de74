use std::time::Duration;

/// Limits and behaviour of the session store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Largest declared file size accepted at session creation.
    pub max_file_size: u64,
    /// Largest chunk size (and chunk payload) accepted.
    pub max_chunk_size: u64,
    /// Server-wide bound on concurrent staging writes. Requests that
    /// cannot get a slot fail with `RateLimited`.
    pub max_concurrent_chunk_writes: usize,
    /// How long terminal sessions are kept as tombstones.
    pub retention: Duration,
    /// Assemble in the background as soon as the last chunk arrives.
    pub assemble_on_last_chunk: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024 * 1024,
            max_chunk_size: 64 * 1024 * 1024,
            max_concurrent_chunk_writes: 64,
            retention: Duration::from_secs(60 * 60),
            assemble_on_last_chunk: false,
        }
    }
}

/// Stale-session sweeper schedule.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Active sessions idle longer than this are expired.
    pub max_idle: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(24 * 60 * 60),
        }
    }
}
