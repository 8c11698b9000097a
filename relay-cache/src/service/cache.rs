//! Cache Service
//!
//! Business rules of the artifact cache: lookup with prefix fallback,
//! reservation, ranged upload, commit, and garbage collection.

use relay_core::domain::cache::CacheRecord;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::config::CacheConfig;
use crate::repository::cache_repository;
use crate::storage::Storage;

/// Service error type
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache {0}: not reserved")]
    NotReserved(i64),

    #[error("cache {id} {key:?}: already complete")]
    AlreadyComplete { id: i64, key: String },

    #[error("{0}")]
    Validation(String),

    #[error("invalid content range: {0}")]
    InvalidRange(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Outcome of a reservation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the slot and should upload to this id
    Reserved(i64),
    /// Another writer is still filling this key/version
    InProgress,
}

/// Byte range of an upload chunk, `stop` inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub stop: u64,
}

impl ContentRange {
    /// Parses a `Content-Range: bytes <start>-<stop>/*` header value
    pub fn parse(value: &str) -> Result<Self, CacheError> {
        let invalid = || CacheError::InvalidRange(value.to_string());

        let range_part = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
        let (range, _total) = range_part.split_once('/').ok_or_else(invalid)?;
        let (start, stop) = range.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let stop: u64 = stop.trim().parse().map_err(|_| invalid())?;

        if stop < start {
            return Err(invalid());
        }
        Ok(Self { start, stop })
    }

    pub fn size(&self) -> u64 {
        self.stop - self.start + 1
    }
}

/// Counts of records removed by one GC sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub idle: usize,
    pub expired: usize,
}

pub struct CacheService {
    pool: SqlitePool,
    storage: Storage,
    idle_timeout: Duration,
    expiration: Duration,
    gc_running: AtomicBool,
}

impl CacheService {
    pub fn new(pool: SqlitePool, storage: Storage, config: &CacheConfig) -> Self {
        Self {
            pool,
            storage,
            idle_timeout: config.idle_timeout,
            expiration: config.expiration,
            gc_running: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Finds the most specific complete record for `keys`
    ///
    /// The first key must match exactly; each further key is tried as a
    /// prefix in the given order, preferring the newest record. A hit whose
    /// blob is missing is deleted and reported as a miss.
    pub async fn lookup(
        &self,
        keys: &[String],
        version: &str,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let Some(record) = self.find(keys, version).await? else {
            return Ok(None);
        };

        if !self.storage.exists(record.id).await? {
            tracing::warn!(
                "Cache {} {:?} has no blob, dropping its record",
                record.id,
                record.key
            );
            cache_repository::delete(&self.pool, record.id).await?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    async fn find(
        &self,
        keys: &[String],
        version: &str,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let Some((exact, prefixes)) = keys.split_first() else {
            return Ok(None);
        };

        if let Some(record) = cache_repository::find_complete(&self.pool, exact, version).await? {
            return Ok(Some(record));
        }

        for prefix in prefixes {
            if let Some(record) =
                cache_repository::find_complete_by_prefix(&self.pool, prefix, version).await?
            {
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    /// Reserves `(key, version)` for upload
    ///
    /// A complete entry is flipped back to incomplete in place and keeps its id.
    pub async fn reserve(&self, key: &str, version: &str) -> Result<Reservation, CacheError> {
        if key.is_empty() {
            return Err(CacheError::Validation("missing key".to_string()));
        }
        if version.is_empty() {
            return Err(CacheError::Validation("missing version".to_string()));
        }

        let now = now();
        match cache_repository::find_by_key_version(&self.pool, key, version).await? {
            None => match cache_repository::insert(&self.pool, key, version, now).await? {
                Some(id) => {
                    tracing::debug!("Reserved new cache {} for {:?}", id, key);
                    Ok(Reservation::Reserved(id))
                }
                None => Ok(Reservation::InProgress),
            },
            Some(record) if !record.complete => Ok(Reservation::InProgress),
            Some(record) => {
                cache_repository::update_complete(&self.pool, record.id, false, now).await?;
                tracing::debug!("Recreating cache {} for {:?}", record.id, key);
                Ok(Reservation::Reserved(record.id))
            }
        }
    }

    /// Loads a record that may still receive data
    async fn writable(&self, id: i64) -> Result<CacheRecord, CacheError> {
        let record = cache_repository::find_by_id(&self.pool, id)
            .await?
            .ok_or(CacheError::NotReserved(id))?;

        if record.complete {
            return Err(CacheError::AlreadyComplete {
                id: record.id,
                key: record.key,
            });
        }
        Ok(record)
    }

    /// Writes one chunk of a reserved entry
    ///
    /// Bytes beyond the declared range are ignored.
    pub async fn upload(&self, id: i64, range: ContentRange, data: &[u8]) -> Result<(), CacheError> {
        let record = self.writable(id).await?;

        let len = data.len().min(usize::try_from(range.size()).unwrap_or(usize::MAX));
        self.storage.write(record.id, range.start, &data[..len]).await?;
        self.touch(record.id).await;
        Ok(())
    }

    /// Makes an uploaded entry visible to lookups
    pub async fn commit(&self, id: i64) -> Result<(), CacheError> {
        let record = self.writable(id).await?;

        self.storage.commit(record.id).await?;
        cache_repository::update_complete(&self.pool, record.id, true, now()).await?;

        tracing::info!("Committed cache {} {:?}", record.id, record.key);
        Ok(())
    }

    /// Refreshes last-used; failures are only logged
    pub async fn touch(&self, id: i64) {
        if let Err(e) = cache_repository::update_used_at(&self.pool, id, now()).await {
            tracing::debug!("Failed to touch cache {}: {}", id, e);
        }
    }

    /// Runs a GC sweep in the background
    pub fn spawn_gc(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.gc().await;
        });
    }

    /// Removes abandoned uploads and expired entries
    ///
    /// Returns `None` without doing anything when another sweep is active.
    pub async fn gc(&self) -> Option<GcReport> {
        if self
            .gc_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _guard = GcGuard(&self.gc_running);

        let now = now();
        let mut report = GcReport::default();

        let idle_before = now - self.idle_timeout.as_secs() as i64;
        match cache_repository::find_idle_incomplete(&self.pool, idle_before).await {
            Ok(records) => report.idle = self.purge(records).await,
            Err(e) => tracing::warn!("Failed to find idle caches: {}", e),
        }

        let expired_before = now - self.expiration.as_secs() as i64;
        match cache_repository::find_unused_since(&self.pool, expired_before).await {
            Ok(records) => report.expired = self.purge(records).await,
            Err(e) => tracing::warn!("Failed to find expired caches: {}", e),
        }

        Some(report)
    }

    async fn purge(&self, records: Vec<CacheRecord>) -> usize {
        let mut deleted = 0;
        for record in records {
            self.storage.remove(record.id).await;
            match cache_repository::delete(&self.pool, record.id).await {
                Ok(_) => {
                    tracing::info!("Deleted cache {:?}", record);
                    deleted += 1;
                }
                Err(e) => tracing::warn!("Failed to delete cache {}: {}", record.id, e),
            }
        }
        deleted
    }
}

struct GcGuard<'a>(&'a AtomicBool);

impl Drop for GcGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn setup() -> (tempfile::TempDir, Arc<CacheService>) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(dir.path());
        let pool = db::create_pool(&config.index_path()).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let storage = Storage::new(config.blob_dir()).await.unwrap();
        (dir, Arc::new(CacheService::new(pool, storage, &config)))
    }

    async fn store(service: &CacheService, key: &str, version: &str, data: &[u8]) -> i64 {
        let Reservation::Reserved(id) = service.reserve(key, version).await.unwrap() else {
            panic!("expected a reservation for {key}");
        };
        let range = ContentRange {
            start: 0,
            stop: data.len() as u64 - 1,
        };
        service.upload(id, range, data).await.unwrap();
        service.commit(id).await.unwrap();
        id
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            ContentRange::parse("bytes 0-3/*").unwrap(),
            ContentRange { start: 0, stop: 3 }
        );
        assert_eq!(ContentRange::parse("bytes 4-7/8").unwrap().size(), 4);
        assert!(ContentRange::parse("bytes 7-4/*").is_err());
        assert!(ContentRange::parse("0-3/*").is_err());
        assert!(ContentRange::parse("bytes a-3/*").is_err());
        assert!(ContentRange::parse("").is_err());
    }

    #[tokio::test]
    async fn test_lookup_exact_ignores_incomplete() {
        let (_dir, service) = setup().await;

        let Reservation::Reserved(pending) = service.reserve("k", "v").await.unwrap() else {
            panic!("expected reservation");
        };
        service
            .upload(pending, ContentRange { start: 0, stop: 1 }, b"ab")
            .await
            .unwrap();
        assert!(service.lookup(&keys(&["k"]), "v").await.unwrap().is_none());

        service.commit(pending).await.unwrap();
        let hit = service.lookup(&keys(&["k"]), "v").await.unwrap().unwrap();
        assert_eq!(hit.id, pending);
        assert_eq!(hit.key, "k");

        assert!(service.lookup(&keys(&["k"]), "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_prefix_prefers_newest() {
        let (_dir, service) = setup().await;

        let older = store(&service, "a-1", "v", b"one").await;
        let newer = store(&service, "a-2", "v", b"two").await;
        assert!(newer > older);

        let hit = service
            .lookup(&keys(&["zzz", "a-"]), "v")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, newer);

        // Prefixes are tried in caller order
        let hit = service
            .lookup(&keys(&["zzz", "a-1", "a-"]), "v")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, older);

        // The first key is never treated as a prefix
        assert!(service.lookup(&keys(&["a-"]), "v").await.unwrap().is_none());
        assert!(service.lookup(&[], "v").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_drops_record_without_blob() {
        let (_dir, service) = setup().await;

        let id = store(&service, "k", "v", b"data").await;
        tokio::fs::remove_file(service.storage().path(id))
            .await
            .unwrap();

        assert!(service.lookup(&keys(&["k"]), "v").await.unwrap().is_none());
        assert!(
            cache_repository::find_by_id(service.pool(), id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_upload_and_touch_refresh_last_used() {
        let (_dir, service) = setup().await;

        let Reservation::Reserved(id) = service.reserve("k", "v").await.unwrap() else {
            panic!("expected reservation");
        };
        cache_repository::update_used_at(service.pool(), id, 1_000)
            .await
            .unwrap();
        service
            .upload(id, ContentRange { start: 0, stop: 1 }, b"ab")
            .await
            .unwrap();
        let record = cache_repository::find_by_id(service.pool(), id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.used_at > 1_000);

        cache_repository::update_used_at(service.pool(), id, 1_000)
            .await
            .unwrap();
        service.touch(id).await;
        let record = cache_repository::find_by_id(service.pool(), id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.used_at > 1_000);
    }

    #[tokio::test]
    async fn test_reserve_in_progress_and_recreate() {
        let (_dir, service) = setup().await;

        let first = service.reserve("k", "v").await.unwrap();
        let Reservation::Reserved(id) = first else {
            panic!("expected reservation");
        };
        assert_eq!(
            service.reserve("k", "v").await.unwrap(),
            Reservation::InProgress
        );

        service
            .upload(id, ContentRange { start: 0, stop: 0 }, b"x")
            .await
            .unwrap();
        service.commit(id).await.unwrap();

        assert_eq!(
            service.reserve("k", "v").await.unwrap(),
            Reservation::Reserved(id)
        );
        let record = cache_repository::find_by_id(service.pool(), id)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.complete);
    }

    #[tokio::test]
    async fn test_reserve_requires_key_and_version() {
        let (_dir, service) = setup().await;

        assert!(matches!(
            service.reserve("", "v").await,
            Err(CacheError::Validation(_))
        ));
        assert!(matches!(
            service.reserve("k", "").await,
            Err(CacheError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_chunks_in_any_order() {
        let (_dir, service) = setup().await;

        let Reservation::Reserved(id) = service.reserve("k", "v").await.unwrap() else {
            panic!("expected reservation");
        };
        service
            .upload(id, ContentRange { start: 4, stop: 7 }, b"5678")
            .await
            .unwrap();
        service
            .upload(id, ContentRange { start: 0, stop: 3 }, b"1234")
            .await
            .unwrap();
        service.commit(id).await.unwrap();

        let blob = tokio::fs::read(service.storage().path(id)).await.unwrap();
        assert_eq!(blob, b"12345678");
    }

    #[tokio::test]
    async fn test_commit_rules() {
        let (_dir, service) = setup().await;

        assert!(matches!(
            service.commit(42).await,
            Err(CacheError::NotReserved(42))
        ));

        let Reservation::Reserved(id) = service.reserve("k", "v").await.unwrap() else {
            panic!("expected reservation");
        };
        // Nothing uploaded yet
        assert!(matches!(service.commit(id).await, Err(CacheError::Storage(_))));

        service
            .upload(id, ContentRange { start: 0, stop: 2 }, b"abc")
            .await
            .unwrap();
        service.commit(id).await.unwrap();

        assert!(matches!(
            service.commit(id).await,
            Err(CacheError::AlreadyComplete { .. })
        ));
        assert!(matches!(
            service
                .upload(id, ContentRange { start: 0, stop: 2 }, b"xyz")
                .await,
            Err(CacheError::AlreadyComplete { .. })
        ));
    }

    #[tokio::test]
    async fn test_gc_thresholds() {
        let (_dir, service) = setup().await;
        let now = now();

        // Incomplete, idle for an hour: reclaimed
        let Reservation::Reserved(idle) = service.reserve("idle", "v").await.unwrap() else {
            panic!("expected reservation");
        };
        service
            .upload(idle, ContentRange { start: 0, stop: 0 }, b"x")
            .await
            .unwrap();
        cache_repository::update_used_at(service.pool(), idle, now - 3600)
            .await
            .unwrap();

        // Complete, unused for an hour: kept
        let kept = store(&service, "kept", "v", b"x").await;
        cache_repository::update_used_at(service.pool(), kept, now - 3600)
            .await
            .unwrap();

        // Complete, unused for 31 days: reclaimed
        let expired = store(&service, "expired", "v", b"x").await;
        cache_repository::update_used_at(service.pool(), expired, now - 31 * 24 * 3600)
            .await
            .unwrap();

        let report = service.gc().await.unwrap();
        assert_eq!(report, GcReport { idle: 1, expired: 1 });

        for gone in [idle, expired] {
            assert!(
                cache_repository::find_by_id(service.pool(), gone)
                    .await
                    .unwrap()
                    .is_none()
            );
            assert!(!service.storage().exists(gone).await.unwrap());
        }
        assert!(service.storage().exists(kept).await.unwrap());
        assert!(service.lookup(&keys(&["kept"]), "v").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gc_skips_while_running() {
        let (_dir, service) = setup().await;

        service.gc_running.store(true, Ordering::SeqCst);
        assert!(service.gc().await.is_none());

        service.gc_running.store(false, Ordering::SeqCst);
        assert_eq!(service.gc().await, Some(GcReport::default()));
        assert!(!service.gc_running.load(Ordering::SeqCst));
    }
}
