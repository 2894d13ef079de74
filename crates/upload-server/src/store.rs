//! Upload session store.
//!
//! Each session lives in a [`SessionSlot`]: an async gate plus a short
//! mutex around the record. Chunk writes hold the gate shared, so
//! different indices of one session stage concurrently. Assembly,
//! cancellation and expiry hold it exclusively and never delete staged
//! bytes under an in-flight write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use chunkline_protocol::{SessionState, UploadChunkResponse, UploadStatusResponse};
use chunkline_transfer::{ChunkLayout, validate_file_name};

use crate::config::StoreConfig;
use crate::error::UploadError;
use crate::identity::CallerIdentity;
use crate::session::{NewSession, UploadSession};
use crate::staging::ChunkStaging;

pub(crate) struct SessionSlot {
    pub(crate) gate: tokio::sync::RwLock<()>,
    record: Mutex<UploadSession>,
    /// Serialises manifest writes so the newest snapshot lands last.
    persist: tokio::sync::Mutex<()>,
}

impl SessionSlot {
    fn new(session: UploadSession) -> Self {
        Self {
            gate: tokio::sync::RwLock::new(()),
            record: Mutex::new(session),
            persist: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn record(&self) -> MutexGuard<'_, UploadSession> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks every upload session and stages its chunks.
pub struct SessionStore {
    config: StoreConfig,
    staging: Arc<dyn ChunkStaging>,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    write_permits: Semaphore,
}

impl SessionStore {
    pub fn new(config: StoreConfig, staging: Arc<dyn ChunkStaging>) -> Self {
        let permits = config.max_concurrent_chunk_writes.max(1);
        Self {
            config,
            staging,
            sessions: RwLock::new(HashMap::new()),
            write_permits: Semaphore::new(permits),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn staging(&self) -> &Arc<dyn ChunkStaging> {
        &self.staging
    }

    /// Number of sessions in memory, tombstones included.
    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of a session record.
    pub fn snapshot(&self, upload_id: &str) -> Option<UploadSession> {
        self.slot(upload_id).map(|slot| slot.record().clone())
    }

    /// Validates `req` and opens a new Active session owned by `owner`.
    pub async fn create_session(
        &self,
        req: NewSession,
        owner: CallerIdentity,
    ) -> Result<String, UploadError> {
        let layout = self.validate_new(&req)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let session = UploadSession::new(upload_id.clone(), req, &layout, owner, Utc::now());

        self.staging.save_manifest(&session).await?;

        tracing::info!(
            upload_id = %upload_id,
            owner = %session.owner,
            file_name = %session.file_name,
            size = session.declared_size,
            chunks = session.total_chunks,
            "upload session created"
        );

        self.write_sessions()
            .insert(upload_id.clone(), Arc::new(SessionSlot::new(session)));
        Ok(upload_id)
    }

    /// Checks session metadata and returns its chunk layout.
    pub fn validate_new(&self, req: &NewSession) -> Result<ChunkLayout, UploadError> {
        validate_file_name(&req.file_name)
            .map_err(|e| UploadError::InvalidArgument(e.to_string()))?;
        if req.declared_size == 0 {
            return Err(UploadError::InvalidArgument("file size must be positive".into()));
        }
        if req.declared_size > self.config.max_file_size {
            return Err(UploadError::InvalidArgument(format!(
                "file size {} exceeds the {}-byte limit",
                req.declared_size, self.config.max_file_size
            )));
        }
        if req.chunk_size == 0 || req.chunk_size > self.config.max_chunk_size {
            return Err(UploadError::InvalidArgument(format!(
                "chunk size must be between 1 and {} bytes",
                self.config.max_chunk_size
            )));
        }
        ChunkLayout::new(req.declared_size, req.chunk_size)
            .map_err(|e| UploadError::InvalidArgument(e.to_string()))
    }

    /// Stores one chunk. Receiving an index again replaces its bytes and
    /// does not change the received count.
    pub async fn receive_chunk(
        &self,
        upload_id: &str,
        index: u32,
        payload: &[u8],
        caller: &CallerIdentity,
    ) -> Result<UploadChunkResponse, UploadError> {
        let size = payload.len() as u64;
        if size > self.config.max_chunk_size {
            return Err(UploadError::PayloadTooLarge {
                size,
                limit: self.config.max_chunk_size,
            });
        }

        let slot = self.require(upload_id)?;
        check_writable(&slot.record(), upload_id, index, size, caller)?;

        let _permit = self
            .write_permits
            .try_acquire()
            .map_err(|_| UploadError::RateLimited)?;
        let _gate = slot.gate.read().await;

        // The session may have been assembled, cancelled or expired while
        // this request waited for the gate.
        check_writable(&slot.record(), upload_id, index, size, caller)?;

        self.staging.put_chunk(upload_id, index, payload).await?;

        let (received, total) = {
            let mut record = slot.record();
            record.received.insert(index);
            record.last_activity_at = Utc::now();
            (record.received.len() as u32, record.total_chunks)
        };
        self.persist(&slot).await?;

        tracing::debug!(
            upload_id = %upload_id,
            chunk_index = index,
            received,
            total,
            "chunk staged"
        );

        Ok(UploadChunkResponse {
            upload_id: upload_id.to_string(),
            chunk_index: index,
            received_count: received,
            total_count: total,
        })
    }

    /// Reports which chunks the server holds.
    pub fn status(
        &self,
        upload_id: &str,
        caller: &CallerIdentity,
    ) -> Result<UploadStatusResponse, UploadError> {
        let slot = self.require(upload_id)?;
        let record = slot.record();
        check_owner(&record, caller)?;
        match record.state {
            SessionState::Active | SessionState::Completed => Ok(record.status()),
            SessionState::Cancelled | SessionState::Expired => {
                Err(UploadError::NotFound(upload_id.to_string()))
            }
        }
    }

    /// Cancels an Active session and drops its staged chunks.
    pub async fn cancel(&self, upload_id: &str, caller: &CallerIdentity) -> Result<(), UploadError> {
        let slot = self.require(upload_id)?;
        let already = check_cancellable(&slot.record(), caller)?;
        if already {
            return Ok(());
        }

        let _gate = slot.gate.write().await;
        {
            let mut record = slot.record();
            if check_cancellable(&record, caller)? {
                return Ok(());
            }
            record.finish(SessionState::Cancelled, Utc::now());
            record.received.clear();
        }

        self.staging.delete_chunks(upload_id).await?;
        self.persist(&slot).await?;
        tracing::info!(upload_id = %upload_id, "upload session cancelled");
        Ok(())
    }

    /// Expires Active sessions idle for longer than `max_idle` and purges
    /// tombstones older than the retention period. Returns how many
    /// sessions were expired.
    pub async fn expire_stale(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::TimeDelta::MAX);
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::TimeDelta::MAX);

        let slots: Vec<(String, Arc<SessionSlot>)> = self
            .read_sessions()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut expired = 0;
        let mut purged = 0;
        for (upload_id, slot) in slots {
            let state = slot.record().state;
            match state {
                SessionState::Active => {
                    if self.expire_one(&upload_id, &slot, now, max_idle).await {
                        expired += 1;
                    }
                }
                _ => {
                    let finished = {
                        let record = slot.record();
                        record.finished_at.unwrap_or(record.last_activity_at)
                    };
                    if is_past(finished, retention, now) && self.purge(&upload_id).await {
                        purged += 1;
                    }
                }
            }
        }

        if expired > 0 || purged > 0 {
            tracing::info!(expired, purged, "swept stale upload sessions");
        }
        expired
    }

    async fn expire_one(
        &self,
        upload_id: &str,
        slot: &Arc<SessionSlot>,
        now: DateTime<Utc>,
        max_idle: chrono::Duration,
    ) -> bool {
        // A held gate means a request is in flight, so the session is not idle.
        let Ok(_gate) = slot.gate.try_write() else {
            return false;
        };
        {
            let mut record = slot.record();
            if record.state != SessionState::Active
                || record.completing
                || !is_past(record.last_activity_at, max_idle, now)
            {
                return false;
            }
            record.finish(SessionState::Expired, now);
            record.received.clear();
        }

        if let Err(e) = self.staging.delete_chunks(upload_id).await {
            tracing::error!(upload_id = %upload_id, "failed to delete expired chunks: {e}");
        }
        if let Err(e) = self.persist(slot).await {
            tracing::error!(upload_id = %upload_id, "failed to persist expiry: {e}");
        }
        tracing::info!(upload_id = %upload_id, "upload session expired");
        true
    }

    async fn purge(&self, upload_id: &str) -> bool {
        if let Err(e) = self.staging.remove_session(upload_id).await {
            tracing::error!(upload_id = %upload_id, "failed to purge session: {e}");
            return false;
        }
        self.write_sessions().remove(upload_id);
        tracing::debug!(upload_id = %upload_id, "tombstone purged");
        true
    }

    /// Reloads persisted sessions. Indices whose chunk is no longer staged
    /// are dropped from the received set. Returns the number of sessions
    /// loaded.
    pub async fn recover(&self) -> Result<usize, UploadError> {
        let manifests = self.staging.load_manifests().await?;
        let mut loaded = 0;

        for mut session in manifests {
            if session.layout().is_none() {
                tracing::warn!(upload_id = %session.upload_id, "skipping manifest with invalid layout");
                continue;
            }

            if session.state == SessionState::Active {
                let mut lost = Vec::new();
                for &index in &session.received {
                    if !self.staging.has_chunk(&session.upload_id, index).await? {
                        lost.push(index);
                    }
                }
                if !lost.is_empty() {
                    tracing::warn!(
                        upload_id = %session.upload_id,
                        lost = ?lost,
                        "staged chunks missing after restart"
                    );
                    for index in &lost {
                        session.received.remove(index);
                    }
                    self.staging.save_manifest(&session).await?;
                }
            }

            let upload_id = session.upload_id.clone();
            self.write_sessions()
                .insert(upload_id, Arc::new(SessionSlot::new(session)));
            loaded += 1;
        }

        if loaded > 0 {
            tracing::info!(sessions = loaded, "recovered upload sessions");
        }
        Ok(loaded)
    }

    /// Drops a session without leaving a tombstone.
    pub(crate) async fn discard(&self, upload_id: &str) {
        self.write_sessions().remove(upload_id);
        if let Err(e) = self.staging.remove_session(upload_id).await {
            tracing::warn!(upload_id = %upload_id, "failed to discard session: {e}");
        }
    }

    pub(crate) fn slot(&self, upload_id: &str) -> Option<Arc<SessionSlot>> {
        self.read_sessions().get(upload_id).cloned()
    }

    pub(crate) fn require(&self, upload_id: &str) -> Result<Arc<SessionSlot>, UploadError> {
        self.slot(upload_id)
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))
    }

    /// Writes the current record as the session manifest.
    pub(crate) async fn persist(&self, slot: &SessionSlot) -> Result<(), UploadError> {
        let _order = slot.persist.lock().await;
        let snapshot = slot.record().clone();
        self.staging.save_manifest(&snapshot).await?;
        Ok(())
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_past(since: DateTime<Utc>, window: chrono::Duration, now: DateTime<Utc>) -> bool {
    since
        .checked_add_signed(window)
        .is_some_and(|deadline| deadline < now)
}

pub(crate) fn check_owner(record: &UploadSession, caller: &CallerIdentity) -> Result<(), UploadError> {
    if &record.owner != caller {
        return Err(UploadError::Forbidden(record.upload_id.clone()));
    }
    Ok(())
}

fn check_writable(
    record: &UploadSession,
    upload_id: &str,
    index: u32,
    size: u64,
    caller: &CallerIdentity,
) -> Result<(), UploadError> {
    check_owner(record, caller)?;
    match record.state {
        SessionState::Active => {}
        SessionState::Completed => {
            return Err(UploadError::InvalidArgument(format!(
                "upload {upload_id} is already completed"
            )));
        }
        SessionState::Cancelled | SessionState::Expired => {
            return Err(UploadError::NotFound(upload_id.to_string()));
        }
    }
    if record.completing {
        return Err(UploadError::AlreadyCompleting(upload_id.to_string()));
    }
    let expected = record.expected_len(index).ok_or_else(|| {
        UploadError::InvalidArgument(format!(
            "chunk index {index} out of range (total {})",
            record.total_chunks
        ))
    })?;
    if size != expected {
        return Err(UploadError::InvalidArgument(format!(
            "chunk {index} has {size} bytes, expected {expected}"
        )));
    }
    Ok(())
}

/// Returns `Ok(true)` when the session is already cancelled.
fn check_cancellable(record: &UploadSession, caller: &CallerIdentity) -> Result<bool, UploadError> {
    check_owner(record, caller)?;
    match record.state {
        SessionState::Cancelled => Ok(true),
        SessionState::Expired => Err(UploadError::NotFound(record.upload_id.clone())),
        SessionState::Completed => Err(UploadError::InvalidArgument(format!(
            "upload {} is completed and cannot be cancelled",
            record.upload_id
        ))),
        SessionState::Active if record.completing => {
            Err(UploadError::AlreadyCompleting(record.upload_id.clone()))
        }
        SessionState::Active => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::{FsChunkStaging, MemoryChunkStaging};
    use tempfile::TempDir;

    fn alice() -> CallerIdentity {
        CallerIdentity::new("alice")
    }

    fn bob() -> CallerIdentity {
        CallerIdentity::new("bob")
    }

    fn new_session(size: u64, chunk: u64) -> NewSession {
        NewSession {
            file_name: "video.mp4".into(),
            declared_size: size,
            mime_type: "video/mp4".into(),
            chunk_size: chunk,
            workspace_context: None,
        }
    }

    fn memory_store() -> (SessionStore, Arc<MemoryChunkStaging>) {
        let staging = Arc::new(MemoryChunkStaging::new());
        let store = SessionStore::new(StoreConfig::default(), staging.clone());
        (store, staging)
    }

    #[tokio::test]
    async fn create_computes_total_chunks() {
        let (store, _) = memory_store();
        let id = store
            .create_session(new_session(2_500_000, 1_000_000), alice())
            .await
            .unwrap();
        let status = store.status(&id, &alice()).unwrap();
        assert_eq!(status.total_chunks, 3);
        assert_eq!(status.missing_chunks, vec![0, 1, 2]);
        assert_eq!(status.state, SessionState::Active);
    }

    #[tokio::test]
    async fn create_rejects_bad_metadata() {
        let (store, _) = memory_store();
        let cases = [
            new_session(0, 1000),
            new_session(1000, 0),
            new_session(11 * 1024 * 1024 * 1024, 1024 * 1024),
            new_session(1000, 128 * 1024 * 1024),
            NewSession {
                file_name: "../etc/passwd".into(),
                ..new_session(1000, 100)
            },
            NewSession {
                file_name: String::new(),
                ..new_session(1000, 100)
            },
        ];
        for req in cases {
            let result = store.create_session(req.clone(), alice()).await;
            assert!(
                matches!(result, Err(UploadError::InvalidArgument(_))),
                "accepted {req:?}"
            );
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn receive_is_idempotent() {
        let (store, staging) = memory_store();
        let id = store
            .create_session(new_session(3000, 1000), alice())
            .await
            .unwrap();

        let first = store
            .receive_chunk(&id, 1, &[1u8; 1000], &alice())
            .await
            .unwrap();
        let again = store
            .receive_chunk(&id, 1, &[2u8; 1000], &alice())
            .await
            .unwrap();
        assert_eq!(first.received_count, 1);
        assert_eq!(again.received_count, 1);
        assert_eq!(again.total_count, 3);
        assert_eq!(staging.read_chunk(&id, 1).await.unwrap(), vec![2u8; 1000]);

        let status = store.status(&id, &alice()).unwrap();
        assert_eq!(status.received_chunks, vec![1]);
        assert_eq!(status.missing_chunks, vec![0, 2]);
    }

    #[tokio::test]
    async fn receive_validates_index_and_length() {
        let (store, _) = memory_store();
        let id = store
            .create_session(new_session(2_500_000, 1_000_000), alice())
            .await
            .unwrap();

        let out_of_range = store
            .receive_chunk(&id, 3, &vec![0u8; 500_000], &alice())
            .await;
        assert!(matches!(out_of_range, Err(UploadError::InvalidArgument(_))));

        let short_middle = store
            .receive_chunk(&id, 1, &vec![0u8; 999_999], &alice())
            .await;
        assert!(matches!(short_middle, Err(UploadError::InvalidArgument(_))));

        let full_last = store
            .receive_chunk(&id, 2, &vec![0u8; 1_000_000], &alice())
            .await;
        assert!(matches!(full_last, Err(UploadError::InvalidArgument(_))));

        let last = store
            .receive_chunk(&id, 2, &vec![0u8; 500_000], &alice())
            .await
            .unwrap();
        assert_eq!(last.received_count, 1);
    }

    #[tokio::test]
    async fn oversized_payload_is_payload_too_large() {
        let staging = Arc::new(MemoryChunkStaging::new());
        let config = StoreConfig {
            max_chunk_size: 1024,
            ..StoreConfig::default()
        };
        let store = SessionStore::new(config, staging);
        let id = store
            .create_session(new_session(4096, 1024), alice())
            .await
            .unwrap();
        let result = store.receive_chunk(&id, 0, &[0u8; 2048], &alice()).await;
        assert!(matches!(
            result,
            Err(UploadError::PayloadTooLarge {
                size: 2048,
                limit: 1024
            })
        ));
    }

    #[tokio::test]
    async fn foreign_caller_is_forbidden_and_nothing_changes() {
        let (store, staging) = memory_store();
        let id = store
            .create_session(new_session(3000, 1000), alice())
            .await
            .unwrap();

        let result = store.receive_chunk(&id, 0, &[0u8; 1000], &bob()).await;
        assert!(matches!(result, Err(UploadError::Forbidden(_))));
        assert!(matches!(
            store.status(&id, &bob()),
            Err(UploadError::Forbidden(_))
        ));
        assert!(matches!(
            store.cancel(&id, &bob()).await,
            Err(UploadError::Forbidden(_))
        ));

        assert_eq!(staging.staged_chunks(&id), 0);
        let status = store.status(&id, &alice()).unwrap();
        assert!(status.received_chunks.is_empty());
        assert_eq!(status.state, SessionState::Active);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (store, _) = memory_store();
        assert!(matches!(
            store.receive_chunk("nope", 0, b"x", &alice()).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            store.status("nope", &alice()),
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            store.cancel("nope", &alice()).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_drops_chunks() {
        let (store, staging) = memory_store();
        let id = store
            .create_session(new_session(3000, 1000), alice())
            .await
            .unwrap();
        store
            .receive_chunk(&id, 0, &[0u8; 1000], &alice())
            .await
            .unwrap();

        store.cancel(&id, &alice()).await.unwrap();
        store.cancel(&id, &alice()).await.unwrap();
        assert_eq!(staging.staged_chunks(&id), 0);
        assert_eq!(
            staging.manifest(&id).unwrap().state,
            SessionState::Cancelled
        );

        assert!(matches!(
            store.receive_chunk(&id, 1, &[0u8; 1000], &alice()).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            store.status(&id, &alice()),
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn expire_stale_expires_only_idle_sessions() {
        let (store, staging) = memory_store();
        let stale = store
            .create_session(new_session(3000, 1000), alice())
            .await
            .unwrap();
        store
            .receive_chunk(&stale, 0, &[0u8; 1000], &alice())
            .await
            .unwrap();

        let now = Utc::now();
        let max_idle = Duration::from_secs(24 * 60 * 60);

        // Nothing is idle yet.
        assert_eq!(store.expire_stale(now, max_idle).await, 0);

        let later = now + chrono::Duration::hours(25);
        assert_eq!(store.expire_stale(later, max_idle).await, 1);
        assert_eq!(staging.staged_chunks(&stale), 0);
        assert_eq!(
            store.snapshot(&stale).unwrap().state,
            SessionState::Expired
        );
        assert!(matches!(
            store.receive_chunk(&stale, 1, &[0u8; 1000], &alice()).await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            store.status(&stale, &alice()),
            Err(UploadError::NotFound(_))
        ));

        // Second sweep does not count it again.
        assert_eq!(store.expire_stale(later, max_idle).await, 0);
    }

    #[tokio::test]
    async fn tombstones_purged_after_retention() {
        let staging = Arc::new(MemoryChunkStaging::new());
        let config = StoreConfig {
            retention: Duration::from_secs(60),
            ..StoreConfig::default()
        };
        let store = SessionStore::new(config, staging.clone());
        let id = store
            .create_session(new_session(3000, 1000), alice())
            .await
            .unwrap();
        store.cancel(&id, &alice()).await.unwrap();

        let max_idle = Duration::from_secs(3600);
        store.expire_stale(Utc::now(), max_idle).await;
        assert!(store.snapshot(&id).is_some());

        store
            .expire_stale(Utc::now() + chrono::Duration::minutes(2), max_idle)
            .await;
        assert!(store.snapshot(&id).is_none());
        assert!(staging.manifest(&id).is_none());
    }

    #[tokio::test]
    async fn saturated_writes_are_rate_limited() {
        let staging = Arc::new(MemoryChunkStaging::new());
        let config = StoreConfig {
            max_concurrent_chunk_writes: 1,
            ..StoreConfig::default()
        };
        let store = SessionStore::new(config, staging);
        let id = store
            .create_session(new_session(3000, 1000), alice())
            .await
            .unwrap();

        let _held = store.write_permits.try_acquire().unwrap();
        let result = store.receive_chunk(&id, 0, &[0u8; 1000], &alice()).await;
        assert!(matches!(result, Err(UploadError::RateLimited)));
    }

    #[tokio::test]
    async fn concurrent_receipts_of_distinct_chunks_all_count() {
        let (store, _) = memory_store();
        let store = Arc::new(store);
        let id = store
            .create_session(new_session(16 * 100, 100), alice())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for index in 0..16u32 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .receive_chunk(&id, index, &[index as u8; 100], &alice())
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let status = store.status(&id, &alice()).unwrap();
        assert_eq!(status.received_chunks.len(), 16);
        assert!(status.missing_chunks.is_empty());
    }

    #[tokio::test]
    async fn recover_restores_sessions_and_drops_lost_chunks() {
        let dir = TempDir::new().unwrap();
        let id = {
            let staging = Arc::new(FsChunkStaging::new(dir.path()));
            let store = SessionStore::new(StoreConfig::default(), staging);
            let id = store
                .create_session(new_session(3000, 1000), alice())
                .await
                .unwrap();
            for index in [0, 1] {
                store
                    .receive_chunk(&id, index, &[7u8; 1000], &alice())
                    .await
                    .unwrap();
            }
            id
        };

        // Lose one staged chunk while the server is down.
        std::fs::remove_file(dir.path().join(&id).join("1.chunk")).unwrap();

        let staging = Arc::new(FsChunkStaging::new(dir.path()));
        let store = SessionStore::new(StoreConfig::default(), staging);
        assert_eq!(store.recover().await.unwrap(), 1);

        let status = store.status(&id, &alice()).unwrap();
        assert_eq!(status.received_chunks, vec![0]);
        assert_eq!(status.missing_chunks, vec![1, 2]);

        store
            .receive_chunk(&id, 1, &[7u8; 1000], &alice())
            .await
            .unwrap();
        assert_eq!(
            store.status(&id, &alice()).unwrap().missing_chunks,
            vec![2]
        );
    }
}
