//! Hybrid cache: a fast key → location index over durable blob files
//!
//! Blobs are written to a uniquely named `.part` file and renamed into place
//! once complete; only then is the index entry written. An index entry whose
//! blob has disappeared is treated as a miss and removed on the next read.
//!
//! Two concurrent `set` calls for the same key both write their own blob;
//! the index points at whichever finished last and the other file becomes
//! an orphan for [`HybridCache::evict_orphans`] to collect.

use crate::utils::{file_chunks, sanitize_filename};
use crate::{ByteStream, GenerateError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const BLOB_EXTENSION: &str = "pdf";
const PART_EXTENSION: &str = "part";
const KEY_PREFIX_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub blob: PathBuf,
    pub expires_at: DateTime<Utc>,
}

impl IndexEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Key-value index with expiry semantics.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheIndex: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IndexEntry>, GenerateError>;

    async fn set(&self, key: &str, blob: &Path, ttl: Duration) -> Result<(), GenerateError>;

    async fn del(&self, key: &str) -> Result<(), GenerateError>;

    /// Remove `key` only while it still points at `blob`. Returns whether an
    /// entry was removed.
    async fn del_if_blob(&self, key: &str, blob: &Path) -> Result<bool, GenerateError>;

    /// Blob locations referenced by unexpired entries.
    async fn referenced(&self) -> Result<Vec<PathBuf>, GenerateError>;
}

/// In-process index; expired entries are dropped when read.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: DashMap<String, IndexEntry>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheIndex for MemoryIndex {
    async fn get(&self, key: &str) -> Result<Option<IndexEntry>, GenerateError> {
        let now = Utc::now();
        let entry = self.entries.get(key).map(|e| e.value().clone());

        match entry {
            Some(entry) if entry.is_expired(now) => {
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn set(&self, key: &str, blob: &Path, ttl: Duration) -> Result<(), GenerateError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| GenerateError::CacheWrite(format!("invalid ttl: {e}")))?;

        self.entries.insert(
            key.to_string(),
            IndexEntry {
                key: key.to_string(),
                blob: blob.to_path_buf(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), GenerateError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn del_if_blob(&self, key: &str, blob: &Path) -> Result<bool, GenerateError> {
        Ok(self.entries.remove_if(key, |_, e| e.blob == blob).is_some())
    }

    async fn referenced(&self) -> Result<Vec<PathBuf>, GenerateError> {
        let now = Utc::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.blob.clone())
            .collect())
    }
}

/// Directory of blob files.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh location for `key`; concurrent writers never collide.
    ///
    /// The readable prefix is ASCII only so the name stays within filesystem
    /// byte limits whatever the key contains.
    pub fn allocate(&self, key: &str) -> PathBuf {
        let prefix: String = sanitize_filename(key)
            .chars()
            .map(|c| if c.is_ascii() { c } else { '_' })
            .take(KEY_PREFIX_LEN)
            .collect();
        let suffix = uuid::Uuid::new_v4().simple();
        self.root.join(format!("{prefix}-{suffix}.{BLOB_EXTENSION}"))
    }

    pub async fn exists(&self, location: &Path) -> bool {
        fs::metadata(location)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    pub async fn open(&self, location: &Path) -> std::io::Result<ByteStream> {
        let file = fs::File::open(location).await?;
        Ok(file_chunks(file))
    }

    /// Stream `source` into `location`, publishing it only once complete.
    /// Returns the number of bytes written.
    pub async fn write(&self, location: &Path, mut source: ByteStream) -> Result<u64, GenerateError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| GenerateError::CacheWrite(e.to_string()))?;

        let partial = location.with_extension(PART_EXTENSION);
        let result = async {
            let mut file = fs::File::create(&partial).await?;
            let mut written = 0u64;

            while let Some(chunk) = source.next().await {
                let chunk = chunk.map_err(|e| {
                    std::io::Error::new(IoErrorKind::Other, format!("source aborted: {e}"))
                })?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }

            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&partial, location).await?;
            Ok::<u64, std::io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => Ok(written),
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    if cleanup.kind() != IoErrorKind::NotFound {
                        warn!("Could not remove partial blob {}: {}", partial.display(), cleanup);
                    }
                }
                Err(GenerateError::CacheWrite(e.to_string()))
            }
        }
    }

    pub async fn delete(&self, location: &Path) -> std::io::Result<()> {
        match fs::remove_file(location).await {
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Successful cache lookup.
pub struct CachedBlob {
    pub location: PathBuf,
    pub stream: ByteStream,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub scanned: usize,
    pub removed: usize,
    pub bytes_freed: u64,
}

pub struct HybridCache {
    index: Arc<dyn CacheIndex>,
    blobs: BlobStore,
    ttl: Duration,
}

impl HybridCache {
    pub fn new(index: Arc<dyn CacheIndex>, blobs: BlobStore, ttl: Duration) -> Self {
        Self { index, blobs, ttl }
    }

    /// In-memory index over `directory`.
    pub fn with_directory(directory: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryIndex::new()), BlobStore::new(directory), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Look up `key`. Index failures and missing blobs are reported as a
    /// miss; a missing blob also removes its stale index entry.
    pub async fn get(&self, key: &str) -> Option<CachedBlob> {
        let entry = match self.index.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("Cache miss for {}", key);
                metrics::increment_counter!(crate::metrics::CACHE_MISSES);
                return None;
            }
            Err(e) => {
                warn!("Cache index lookup for {} failed, treating as miss: {}", key, e);
                metrics::increment_counter!(crate::metrics::CACHE_MISSES);
                return None;
            }
        };

        if !self.blobs.exists(&entry.blob).await {
            self.heal(key, &entry.blob).await;
            return None;
        }

        match self.blobs.open(&entry.blob).await {
            Ok(stream) => {
                info!("Cache hit for {} ({})", key, entry.blob.display());
                metrics::increment_counter!(crate::metrics::CACHE_HITS);
                Some(CachedBlob {
                    location: entry.blob,
                    stream,
                })
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                self.heal(key, &entry.blob).await;
                None
            }
            Err(e) => {
                warn!("Could not open cached blob {}: {}", entry.blob.display(), e);
                metrics::increment_counter!(crate::metrics::CACHE_MISSES);
                None
            }
        }
    }

    async fn heal(&self, key: &str, blob: &Path) {
        warn!(
            "Cache entry for {} points at missing blob {}, removing",
            key,
            blob.display()
        );
        metrics::increment_counter!(crate::metrics::CACHE_SELF_HEALS);
        metrics::increment_counter!(crate::metrics::CACHE_MISSES);

        match self.index.del_if_blob(key, blob).await {
            Ok(true) => {}
            Ok(false) => debug!("Index entry for {} was replaced before it could be healed", key),
            Err(e) => warn!("Could not remove stale index entry for {}: {}", key, e),
        }
    }

    /// Stream `source` into a new blob and index it under `key` with `ttl`.
    ///
    /// The index is written only after the blob is complete. On failure the
    /// partial blob is removed and the index is left untouched.
    pub async fn set(
        &self,
        key: &str,
        source: ByteStream,
        ttl: Duration,
    ) -> Result<PathBuf, GenerateError> {
        let location = self.blobs.allocate(key);

        let written = match self.blobs.write(&location, source).await {
            Ok(written) => written,
            Err(e) => {
                metrics::increment_counter!(crate::metrics::CACHE_WRITES_FAILED);
                return Err(e);
            }
        };

        if let Err(e) = self.index.set(key, &location, ttl).await {
            metrics::increment_counter!(crate::metrics::CACHE_WRITES_FAILED);
            if let Err(cleanup) = self.blobs.delete(&location).await {
                warn!("Could not remove unindexed blob {}: {}", location.display(), cleanup);
            }
            return Err(GenerateError::CacheWrite(e.to_string()));
        }

        info!(
            "Cached {} ({} bytes) at {}",
            key,
            written,
            location.display()
        );
        metrics::increment_counter!(crate::metrics::CACHE_WRITES);
        Ok(location)
    }

    /// Remove blob files older than `max_age` that no live index entry
    /// references. Unfinished `.part` files of the same age are removed too.
    pub async fn evict_orphans(&self, max_age: Duration) -> Result<EvictionReport, GenerateError> {
        let referenced: HashSet<PathBuf> = self.index.referenced().await?.into_iter().collect();
        let mut report = EvictionReport::default();

        let mut entries = match fs::read_dir(self.blobs.root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if !matches!(ext, Some(BLOB_EXTENSION) | Some(PART_EXTENSION)) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            report.scanned += 1;

            if referenced.contains(&path) {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }

            match self.blobs.delete(&path).await {
                Ok(()) => {
                    debug!("Evicted orphan blob {} (age {:?})", path.display(), age);
                    report.removed += 1;
                    report.bytes_freed += metadata.len();
                }
                Err(e) => warn!("Could not evict {}: {}", path.display(), e),
            }
        }

        info!(
            "Orphan eviction: scanned {}, removed {}, freed {} bytes",
            report.scanned, report.removed, report.bytes_freed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::chunks_stream;
    use tokio_test::assert_ok;

    const KEY: &str = "https://example.com/report";

    fn cache(dir: &Path) -> HybridCache {
        HybridCache::with_directory(dir, Duration::from_secs(60))
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend(chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_set_then_get_returns_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        let payload: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 1000]).collect();
        let expected: Vec<u8> = payload.concat();
        let source = chunks_stream(payload.into_iter().map(Ok).collect());

        let location = assert_ok!(cache.set(KEY, source, cache.ttl()).await);
        assert!(location.starts_with(dir.path()));
        assert_eq!(location.extension().unwrap(), "pdf");

        let hit = cache.get(KEY).await.expect("cache hit");
        assert_eq!(hit.location, location);
        assert_eq!(read_all(hit.stream).await, expected);
    }

    #[tokio::test]
    async fn test_missing_blob_heals_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryIndex::new());
        let cache = HybridCache::new(index.clone(), BlobStore::new(dir.path()), Duration::from_secs(60));

        let location = cache
            .set(KEY, chunks_stream(vec![Ok(b"%PDF-1.7".to_vec())]), cache.ttl())
            .await
            .unwrap();
        assert_eq!(index.len(), 1);

        std::fs::remove_file(&location).unwrap();

        assert!(cache.get(KEY).await.is_none());
        assert!(index.is_empty());

        // Re-running is a no-op
        assert!(cache.get(KEY).await.is_none());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_long_non_ascii_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let key = format!("https://e.jp/{}{}", "日本語".repeat(24), "🦀".repeat(40));

        let location = assert_ok!(
            cache
                .set(&key, chunks_stream(vec![Ok(b"%PDF-1.7".to_vec())]), cache.ttl())
                .await
        );
        let name = location.file_name().unwrap().to_str().unwrap();
        assert!(name.is_ascii());
        assert!(name.len() < 255);

        let hit = cache.get(&key).await.expect("cache hit");
        assert_eq!(read_all(hit.stream).await, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn test_heal_keeps_entry_replaced_by_concurrent_set() {
        let index = MemoryIndex::new();
        let stale = PathBuf::from("/cache/stale.pdf");
        let fresh = PathBuf::from("/cache/fresh.pdf");
        let ttl = Duration::from_secs(60);

        index.set(KEY, &fresh, ttl).await.unwrap();
        assert!(!index.del_if_blob(KEY, &stale).await.unwrap());
        assert_eq!(index.get(KEY).await.unwrap().unwrap().blob, fresh);

        assert!(index.del_if_blob(KEY, &fresh).await.unwrap());
        assert!(index.is_empty());

        index.set(KEY, &stale, ttl).await.unwrap();
        index.del(KEY).await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_heal_only_removes_the_stale_blob_entry() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("gone.pdf");
        let expected = stale.clone();

        let mut index = MockCacheIndex::new();
        let entry = IndexEntry {
            key: KEY.to_string(),
            blob: stale.clone(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };
        index.expect_get().returning(move |_| Ok(Some(entry.clone())));
        index
            .expect_del_if_blob()
            .withf(move |key, blob| key == KEY && blob == expected.as_path())
            .times(1)
            .returning(|_, _| Ok(false));
        index.expect_del().never();

        let cache = HybridCache::new(Arc::new(index), BlobStore::new(dir.path()), Duration::from_secs(60));
        assert!(cache.get(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_blob_and_no_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryIndex::new());
        let cache = HybridCache::new(index.clone(), BlobStore::new(dir.path()), Duration::from_secs(60));

        let source = chunks_stream(vec![
            Ok(vec![1; 512]),
            Err(GenerateError::Stream("upstream reset".into())),
        ]);
        let err = cache.set(KEY, source, cache.ttl()).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CacheWrite);

        assert!(index.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(cache.get(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_sets_use_distinct_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        let (first, second) = tokio::join!(
            cache.set(KEY, chunks_stream(vec![Ok(b"one".to_vec())]), cache.ttl()),
            cache.set(KEY, chunks_stream(vec![Ok(b"two".to_vec())]), cache.ttl()),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());

        let hit = cache.get(KEY).await.unwrap();
        assert!(hit.location == first || hit.location == second);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        cache
            .set(KEY, chunks_stream(vec![Ok(b"x".to_vec())]), Duration::ZERO)
            .await
            .unwrap();
        assert!(cache.get(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_index_read_error_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = MockCacheIndex::new();
        index
            .expect_get()
            .returning(|_| Err(GenerateError::CacheRead("index unavailable".into())));
        index.expect_del_if_blob().never();

        let cache = HybridCache::new(Arc::new(index), BlobStore::new(dir.path()), Duration::from_secs(60));
        assert!(cache.get(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_index_write_error_removes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = MockCacheIndex::new();
        index
            .expect_set()
            .times(1)
            .returning(|_, _, _| Err(GenerateError::CacheWrite("index unavailable".into())));

        let cache = HybridCache::new(Arc::new(index), BlobStore::new(dir.path()), Duration::from_secs(60));
        let result = cache
            .set(KEY, chunks_stream(vec![Ok(b"data".to_vec())]), cache.ttl())
            .await;

        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_evict_orphans_keeps_referenced_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        let live = cache
            .set(KEY, chunks_stream(vec![Ok(b"live".to_vec())]), cache.ttl())
            .await
            .unwrap();
        let orphan = dir.path().join("orphan-abc.pdf");
        std::fs::write(&orphan, b"orphaned").unwrap();
        let partial = dir.path().join("crashed-def.part");
        std::fs::write(&partial, b"half").unwrap();
        let foreign = dir.path().join("README.txt");
        std::fs::write(&foreign, b"keep me").unwrap();

        // Nothing is old enough yet
        let report = cache.evict_orphans(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.removed, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = cache.evict_orphans(Duration::ZERO).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.bytes_freed, 12);
        assert!(live.exists());
        assert!(!orphan.exists());
        assert!(!partial.exists());
        assert!(foreign.exists());
    }

    #[tokio::test]
    async fn test_evict_missing_directory_is_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir.path().join("never-created"));
        let report = cache.evict_orphans(Duration::ZERO).await.unwrap();
        assert_eq!(report, EvictionReport::default());
    }
}
