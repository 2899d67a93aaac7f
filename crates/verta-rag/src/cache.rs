//! Per-(user, product) retriever cache
//!
//! Building a review index means a database round trip plus one embedding
//! call per review, so each `(user_id, parent_asin)` pair is built once and
//! reused until its TTL runs out. The index and a metadata snapshot are
//! persisted under the cache root:
//!
//! ```text
//! {root}/faiss/{user_id}-{asin}/index.json
//! {root}/meta/{user_id}-{asin}.json
//! ```
//!
//! Uses the moka crate for the key table. `try_get_with` coalesces concurrent
//! misses on one key into a single build. Expiry is handled here rather than
//! by moka so that a key is only dropped after its files are gone.
//!
//! Evictions take the write side of `eviction_lock`. Cache hits and
//! [`RetrieverCache::checkout`] hold the read side while they confirm that the
//! entry they hand out is still the live one, so a caller never receives an
//! entry whose files are being deleted.
//!
//! [`RetrieverCache::restore`] adopts the pairs an earlier process left on
//! disk, so they expire like any other entry.

use std::collections::HashSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use verta_core::{CacheConfig, ProductMetadata, ProductStore, Result, Review, VertaError};
use verta_vector::{EmbeddingClient, ReviewIndex};

// ============================================================================
// Keys and entries
// ============================================================================

/// Composite cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: String,
    pub asin: String,
}

impl CacheKey {
    /// Validate both identifiers and build the key.
    ///
    /// Identifiers become file names and `-` joins them, so only ASCII
    /// alphanumerics, `_` and `.` are accepted, and never `..`.
    pub fn new(user_id: &str, asin: &str) -> Result<Self> {
        check_identifier("user_id", user_id)?;
        check_identifier("asin", asin)?;
        Ok(Self {
            user_id: user_id.to_string(),
            asin: asin.to_string(),
        })
    }
}

impl CacheKey {
    /// Parse a rendered key such as a snapshot file stem
    pub fn parse(rendered: &str) -> Result<Self> {
        let (user_id, asin) = rendered.split_once('-').ok_or_else(|| {
            VertaError::ValidationError(format!("Not a cache key: {rendered}"))
        })?;
        Self::new(user_id, asin)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.user_id, self.asin)
    }
}

fn check_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(VertaError::ValidationError(format!("{field} must not be empty")));
    }
    let allowed = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !allowed || value.contains("..") || value.starts_with('.') {
        return Err(VertaError::ValidationError(format!(
            "{field} contains unsupported characters: {value}"
        )));
    }
    Ok(())
}

/// A built retriever and metadata snapshot for one key
#[derive(Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub index_dir: PathBuf,
    pub metadata_path: PathBuf,
    pub index: Arc<ReviewIndex>,
    pub metadata: Arc<ProductMetadata>,
    pub created_at: DateTime<Utc>,
    built_at: Instant,
}

impl CacheEntry {
    /// Time since the entry was built
    pub fn age(&self) -> Duration {
        self.built_at.elapsed()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() >= ttl
    }

    /// Fail with `UninitializedRetriever` if either persisted artifact is gone
    pub async fn verify_storage(&self) -> Result<()> {
        let index_file = self.index_dir.join(verta_vector::index::INDEX_FILE);
        if !path_exists(&index_file).await {
            return Err(VertaError::UninitializedRetriever(format!(
                "Retriever not initialized for {}",
                self.key
            )));
        }
        if !path_exists(&self.metadata_path).await {
            return Err(VertaError::UninitializedRetriever(format!(
                "Metadata not initialized for {}",
                self.key
            )));
        }
        Ok(())
    }

    /// Delete the index directory and the metadata snapshot.
    ///
    /// Already-missing artifacts count as deleted.
    async fn remove_storage(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.index_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VertaError::StorageError(format!(
                    "Failed to delete {}: {e}",
                    self.index_dir.display()
                )))
            }
        }
        match tokio::fs::remove_file(&self.metadata_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VertaError::StorageError(format!(
                "Failed to delete {}: {e}",
                self.metadata_path.display()
            ))),
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

// ============================================================================
// Retriever cache
// ============================================================================

/// Outcome of one eviction sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    pub scanned: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Outcome of adopting storage left by an earlier process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub adopted: usize,
    pub purged: usize,
    pub failed: usize,
}

/// Cache of built retrievers keyed by `(user_id, asin)`
pub struct RetrieverCache {
    entries: Cache<CacheKey, Arc<CacheEntry>>,
    store: Arc<dyn ProductStore>,
    embedder: Arc<dyn EmbeddingClient>,
    index_root: PathBuf,
    meta_root: PathBuf,
    ttl: Duration,
    eviction_lock: RwLock<()>,
    stats: Arc<CacheStats>,
}

impl RetrieverCache {
    pub fn new(
        config: &CacheConfig,
        store: Arc<dyn ProductStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            entries: Cache::builder().build(),
            store,
            embedder,
            index_root: config.index_dir(),
            meta_root: config.meta_dir(),
            ttl: config.ttl(),
            eviction_lock: RwLock::new(()),
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Embedding client shared with retrievers built from this cache
    pub fn embedder(&self) -> Arc<dyn EmbeddingClient> {
        Arc::clone(&self.embedder)
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Number of cached keys (approximate)
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Return the entry for `(user_id, asin)`, building it on a miss.
    ///
    /// Concurrent calls for an uncached key share one build. A failed build
    /// leaves no entry behind. An entry past its TTL is evicted and rebuilt.
    pub async fn ensure(&self, asin: &str, user_id: &str) -> Result<Arc<CacheEntry>> {
        let key = CacheKey::new(user_id, asin)?;

        if let Some(entry) = self.entries.get(&key).await {
            if entry.is_expired(self.ttl) {
                tracing::info!(key = %key, age_secs = entry.age().as_secs(), "Retriever expired");
                self.evict(&entry).await?;
            } else {
                let _lease = self.eviction_lock.read().await;
                if self.is_current(&entry).await {
                    self.stats.record_hit();
                    tracing::debug!(key = %key, "Retriever cache hit");
                    return Ok(entry);
                }
                tracing::debug!(key = %key, "Retriever evicted while waiting, rebuilding");
            }
        }

        let built_here = AtomicBool::new(false);
        let init = async {
            built_here.store(true, Ordering::Relaxed);
            self.build(&key).await
        };

        let entry = self
            .entries
            .try_get_with(key.clone(), init)
            .await
            .map_err(|e| VertaError::from_shared(&e))?;

        if built_here.load(Ordering::Relaxed) {
            self.stats.record_miss();
        } else {
            self.stats.record_hit();
        }
        Ok(entry)
    }

    /// [`ensure`](Self::ensure) followed by [`CacheEntry::verify_storage`],
    /// with no eviction of the key in between.
    ///
    /// An entry evicted between the two steps is rebuilt once.
    pub async fn checkout(&self, asin: &str, user_id: &str) -> Result<Arc<CacheEntry>> {
        for _ in 0..2 {
            let entry = self.ensure(asin, user_id).await?;
            let _lease = self.eviction_lock.read().await;
            if self.is_current(&entry).await {
                entry.verify_storage().await?;
                return Ok(entry);
            }
        }
        Err(VertaError::UninitializedRetriever(format!(
            "Retriever for {user_id}-{asin} was evicted during checkout"
        )))
    }

    /// Whether `entry` is still the one stored under its key
    async fn is_current(&self, entry: &Arc<CacheEntry>) -> bool {
        matches!(
            self.entries.get(&entry.key).await,
            Some(current) if Arc::ptr_eq(&current, entry)
        )
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn build(&self, key: &CacheKey) -> Result<Arc<CacheEntry>> {
        let started = Instant::now();

        let record = self.store.fetch_product(&key.asin).await?;
        let documents: Vec<_> = record
            .reviews
            .into_iter()
            .filter_map(Review::into_document)
            .collect();

        if documents.is_empty() {
            return Err(VertaError::DataUnavailable(format!(
                "No reviews with text for product {}",
                key.asin
            )));
        }

        let index = ReviewIndex::build(documents, self.embedder.as_ref()).await?;

        let entry = CacheEntry {
            key: key.clone(),
            index_dir: self.index_dir_for(key),
            metadata_path: self.metadata_path_for(key),
            index: Arc::new(index),
            metadata: Arc::new(record.metadata),
            created_at: Utc::now(),
            built_at: Instant::now(),
        };

        if let Err(e) = persist(&entry).await {
            if let Err(cleanup) = entry.remove_storage().await {
                tracing::warn!(error = %cleanup, "Failed to clean up partial retriever");
            }
            return Err(VertaError::IndexBuildFailed(format!(
                "Failed to persist retriever: {e}"
            )));
        }

        self.stats.record_build();
        tracing::info!(
            documents = entry.index.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built retriever"
        );
        Ok(Arc::new(entry))
    }

    fn index_dir_for(&self, key: &CacheKey) -> PathBuf {
        self.index_root.join(key.to_string())
    }

    fn metadata_path_for(&self, key: &CacheKey) -> PathBuf {
        self.meta_root.join(format!("{key}.json"))
    }

    /// Adopt retrievers persisted by an earlier process.
    ///
    /// Every metadata snapshot with a readable index built by the current
    /// embedding model becomes an entry aged from the snapshot's modification
    /// time, so the TTL and the sweeper apply to it as usual. Expired pairs,
    /// incomplete pairs, and files that do not belong to a valid key are
    /// deleted.
    pub async fn restore(&self) -> RestoreReport {
        let _guard = self.eviction_lock.write().await;
        let mut report = RestoreReport::default();
        let mut adopted = HashSet::new();

        for path in list_dir(&self.meta_root).await {
            let key = path
                .extension()
                .filter(|ext| *ext == "json")
                .and(path.file_stem())
                .and_then(|stem| stem.to_str())
                .and_then(|stem| CacheKey::parse(stem).ok());

            let Some(key) = key else {
                match remove_path(&path).await {
                    Ok(()) => report.purged += 1,
                    Err(_) => report.failed += 1,
                }
                continue;
            };

            match self.adopt(&key, &path).await {
                Ok(entry) => {
                    self.entries.insert(key.clone(), Arc::new(entry)).await;
                    adopted.insert(key.to_string());
                    report.adopted += 1;
                }
                Err(reason) => {
                    tracing::info!(key = %key, %reason, "Discarding persisted retriever");
                    let stale = (self.index_dir_for(&key), path);
                    let removed = match remove_path(&stale.0).await {
                        Ok(()) => remove_path(&stale.1).await,
                        Err(e) => Err(e),
                    };
                    match removed {
                        Ok(()) => report.purged += 1,
                        Err(_) => report.failed += 1,
                    }
                }
            }
        }

        // Index directories without a snapshot.
        for path in list_dir(&self.index_root).await {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if adopted.contains(name) {
                continue;
            }
            match remove_path(&path).await {
                Ok(()) => report.purged += 1,
                Err(_) => report.failed += 1,
            }
        }

        tracing::info!(
            adopted = report.adopted,
            purged = report.purged,
            failed = report.failed,
            "Restored retriever cache"
        );
        report
    }

    /// Load one persisted pair, or say why it cannot be used
    async fn adopt(&self, key: &CacheKey, metadata_path: &Path) -> std::result::Result<CacheEntry, String> {
        let modified = tokio::fs::metadata(metadata_path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| format!("unreadable snapshot: {e}"))?;
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age >= self.ttl {
            return Err("expired".to_string());
        }

        let bytes = tokio::fs::read(metadata_path)
            .await
            .map_err(|e| format!("unreadable snapshot: {e}"))?;
        let metadata: ProductMetadata =
            serde_json::from_slice(&bytes).map_err(|e| format!("corrupt snapshot: {e}"))?;

        let index_dir = self.index_dir_for(key);
        let index = ReviewIndex::load(&index_dir)
            .await
            .map_err(|e| format!("unusable index: {e}"))?;
        if index.model != self.embedder.model() {
            return Err(format!(
                "index built with {}, current model is {}",
                index.model,
                self.embedder.model()
            ));
        }

        Ok(CacheEntry {
            key: key.clone(),
            index_dir,
            metadata_path: metadata_path.to_path_buf(),
            index: Arc::new(index),
            metadata: Arc::new(metadata),
            created_at: DateTime::<Utc>::from(modified),
            built_at: Instant::now().checked_sub(age).unwrap_or_else(Instant::now),
        })
    }

    /// Delete an entry's storage, then drop its key.
    ///
    /// The key stays if deletion fails. Does nothing if the key has since
    /// been evicted or rebuilt by someone else.
    async fn evict(&self, entry: &Arc<CacheEntry>) -> Result<()> {
        let _guard = self.eviction_lock.write().await;

        if !self.is_current(entry).await {
            return Ok(());
        }

        if let Err(e) = entry.remove_storage().await {
            self.stats.record_eviction_failure();
            tracing::error!(key = %entry.key, error = %e, "Failed to evict retriever");
            return Err(e);
        }

        self.entries.invalidate(&entry.key).await;
        self.stats.record_eviction();
        tracing::info!(key = %entry.key, "Evicted retriever");
        Ok(())
    }

    /// Evict every entry older than `ttl`
    pub async fn evict_expired(&self, ttl: Duration) -> EvictionReport {
        let mut report = EvictionReport::default();

        let expired: Vec<Arc<CacheEntry>> = self
            .entries
            .iter()
            .map(|(_, entry)| entry)
            .inspect(|_| report.scanned += 1)
            .filter(|entry| entry.is_expired(ttl))
            .collect();

        for entry in expired {
            match self.evict(&entry).await {
                Ok(()) => report.evicted += 1,
                Err(_) => report.failed += 1,
            }
        }

        if report.evicted > 0 || report.failed > 0 {
            tracing::info!(
                scanned = report.scanned,
                evicted = report.evicted,
                failed = report.failed,
                "Retriever cache sweep"
            );
        }
        report
    }

    /// Run [`evict_expired`](Self::evict_expired) every `interval` until
    /// `shutdown` is cancelled
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.evict_expired(ttl).await;
                    }
                }
            }
            tracing::debug!("Retriever cache sweeper stopped");
        })
    }
}

/// Paths directly inside `dir`; a missing directory is empty
async fn list_dir(dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return paths,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to list cache directory");
            return paths;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => paths.push(entry.path()),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to list cache directory");
                break;
            }
        }
    }
    paths
}

/// Remove a file or directory; a missing path counts as removed
async fn remove_path(path: &Path) -> Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete cache file");
            Err(VertaError::StorageError(format!(
                "Failed to delete {}: {e}",
                path.display()
            )))
        }
    }
}

async fn persist(entry: &CacheEntry) -> Result<()> {
    entry.index.save(&entry.index_dir).await?;

    if let Some(parent) = entry.metadata_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VertaError::StorageError(format!("Failed to create {}: {e}", parent.display())))?;
    }

    let snapshot = serde_json::to_vec_pretty(entry.metadata.as_ref())
        .map_err(|e| VertaError::StorageError(format!("Failed to encode metadata: {e}")))?;
    tokio::fs::write(&entry.metadata_path, snapshot)
        .await
        .map_err(|e| {
            VertaError::StorageError(format!(
                "Failed to write {}: {e}",
                entry.metadata_path.display()
            ))
        })
}

// ============================================================================
// Cache Statistics
// ============================================================================

/// Counters for cache monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    evictions: AtomicU64,
    eviction_failures: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction_failure(&self) {
        self.eviction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Successful builds
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn eviction_failures(&self) -> u64 {
        self.eviction_failures.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    /// Get a summary report
    pub fn report(&self) -> CacheStatsReport {
        CacheStatsReport {
            hits: self.hits(),
            misses: self.misses(),
            builds: self.builds(),
            evictions: self.evictions(),
            eviction_failures: self.eviction_failures(),
            hit_rate: self.hit_rate(),
        }
    }
}

/// Serializable cache statistics report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsReport {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub evictions: u64,
    pub eviction_failures: u64,
    pub hit_rate: f64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use verta_core::ProductRecord;

    struct CountingStore {
        calls: AtomicUsize,
        delay: Duration,
        reviews: Vec<&'static str>,
    }

    impl CountingStore {
        fn new(reviews: Vec<&'static str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                reviews,
            }
        }
    }

    #[async_trait]
    impl ProductStore for CountingStore {
        async fn fetch_product(&self, parent_asin: &str) -> Result<ProductRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if parent_asin == "MISSING" {
                return Err(VertaError::DataUnavailable("no rows".to_string()));
            }
            Ok(ProductRecord {
                metadata: ProductMetadata::new(parent_asin).with_title("Test product"),
                reviews: self
                    .reviews
                    .iter()
                    .map(|text| Review {
                        parent_asin: parent_asin.to_string(),
                        text: Some(text.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            })
        }
    }

    struct LengthEmbedding;

    #[async_trait]
    impl EmbeddingClient for LengthEmbedding {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn model(&self) -> &str {
            "length"
        }
    }

    fn cache_with(store: Arc<CountingStore>, root: &Path) -> RetrieverCache {
        let config = CacheConfig {
            root_dir: root.to_path_buf(),
            ..Default::default()
        };
        RetrieverCache::new(&config, store, Arc::new(LengthEmbedding))
    }

    #[test]
    fn test_cache_key_validation() {
        assert_eq!(CacheKey::new("42", "B072K6TLJX").unwrap().to_string(), "42-B072K6TLJX");
        assert!(CacheKey::new("", "B0001").is_err());
        assert!(CacheKey::new("u1", "").is_err());
        assert!(CacheKey::new("../etc", "B0001").is_err());
        assert!(CacheKey::new("u1", "a/b").is_err());
        assert!(CacheKey::new("u-1", "B0001").is_err());
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good", "bad"]));
        let cache = cache_with(Arc::clone(&store), dir.path());

        let first = cache.ensure("B0001", "u1").await.unwrap();
        let second = cache.ensure("B0001", "u1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.index_dir, second.index_dir);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().builds(), 1);
        assert_eq!(cache.stats().hits(), 1);
        first.verify_storage().await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_are_isolated_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = cache_with(Arc::clone(&store), dir.path());

        let a = cache.ensure("A", "u1").await.unwrap();
        let b = cache.ensure("A", "u2").await.unwrap();

        assert_ne!(a.index_dir, b.index_dir);
        assert_ne!(a.metadata_path, b.metadata_path);
        assert!(a.metadata_path.ends_with("u1-A.json"));
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_builds_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore {
            delay: Duration::from_millis(50),
            ..CountingStore::new(vec!["good"])
        });
        let cache = Arc::new(cache_with(Arc::clone(&store), dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.ensure("B0001", "u1").await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().builds(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = cache_with(Arc::clone(&store), dir.path());

        for _ in 0..2 {
            let err = cache.ensure("MISSING", "u1").await.unwrap_err();
            assert!(matches!(err, VertaError::DataUnavailable(_)));
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reviews_without_text_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["", "   "]));
        let cache = cache_with(store, dir.path());

        let err = cache.ensure("B0001", "u1").await.unwrap_err();
        assert!(matches!(err, VertaError::DataUnavailable(_)));
        assert!(!dir.path().join("faiss").join("u1-B0001").exists());
    }

    #[tokio::test]
    async fn test_missing_storage_is_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = cache_with(store, dir.path());

        let entry = cache.ensure("B0001", "u1").await.unwrap();
        std::fs::remove_dir_all(&entry.index_dir).unwrap();

        let again = cache.ensure("B0001", "u1").await.unwrap();
        let err = again.verify_storage().await.unwrap_err();
        assert!(matches!(err, VertaError::UninitializedRetriever(_)));
    }

    #[tokio::test]
    async fn test_hit_waits_for_eviction_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = Arc::new(cache_with(Arc::clone(&store), dir.path()));
        let stale = cache.ensure("B0001", "u1").await.unwrap();

        // Hold the eviction side as an in-flight eviction would.
        let eviction = cache.eviction_lock.write().await;
        let pending = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.checkout("B0001", "u1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        stale.remove_storage().await.unwrap();
        cache.entries.invalidate(&stale.key).await;
        drop(eviction);

        let fresh = pending.await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&fresh, &stale));
        fresh.verify_storage().await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ensure_during_eviction_never_returns_evicted_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = Arc::new(cache_with(Arc::clone(&store), dir.path()));
        let stale = cache.ensure("B0001", "u1").await.unwrap();

        let eviction = cache.eviction_lock.write().await;
        let pending = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.ensure("B0001", "u1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        stale.remove_storage().await.unwrap();
        cache.entries.invalidate(&stale.key).await;
        drop(eviction);

        let fresh = pending.await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&fresh, &stale));
        fresh.verify_storage().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkout_rejects_missing_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = cache_with(store, dir.path());

        let entry = cache.checkout("B0001", "u1").await.unwrap();
        std::fs::remove_file(&entry.metadata_path).unwrap();

        let err = cache.checkout("B0001", "u1").await.unwrap_err();
        assert!(matches!(err, VertaError::UninitializedRetriever(_)));
    }

    #[tokio::test]
    async fn test_evict_expired_deletes_storage_then_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = cache_with(Arc::clone(&store), dir.path());

        let entry = cache.ensure("B0001", "u1").await.unwrap();
        assert_eq!(cache.evict_expired(Duration::from_secs(3600)).await.evicted, 0);

        let report = cache.evict_expired(Duration::ZERO).await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.failed, 0);
        assert!(!entry.index_dir.exists());
        assert!(!entry.metadata_path.exists());

        cache.ensure("B0001", "u1").await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_eviction_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = cache_with(Arc::clone(&store), dir.path());

        let entry = cache.ensure("B0001", "u1").await.unwrap();
        // A plain file where the index directory should be cannot be removed as a directory.
        std::fs::remove_dir_all(&entry.index_dir).unwrap();
        std::fs::write(&entry.index_dir, b"not a directory").unwrap();

        let report = cache.evict_expired(Duration::ZERO).await;
        assert_eq!(report.evicted, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(cache.stats().eviction_failures(), 1);

        let still = cache.ensure("B0001", "u1").await.unwrap();
        assert!(Arc::ptr_eq(&entry, &still));
        assert!(still.verify_storage().await.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = Arc::new(cache_with(store, dir.path()));
        let entry = cache.ensure("B0001", "u1").await.unwrap();

        let token = CancellationToken::new();
        let handle = Arc::clone(&cache).spawn_sweeper(
            Duration::from_millis(10),
            Duration::ZERO,
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(!entry.index_dir.exists());
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[test]
    fn test_cache_key_parses_rendered_form() {
        let key = CacheKey::parse("u1-B0001").unwrap();
        assert_eq!(key, CacheKey::new("u1", "B0001").unwrap());
        assert!(CacheKey::parse("no_separator").is_err());
        assert!(CacheKey::parse("-B0001").is_err());
    }

    #[tokio::test]
    async fn test_restore_adopts_storage_from_previous_process() {
        let dir = tempfile::tempdir().unwrap();
        let first = cache_with(Arc::new(CountingStore::new(vec!["good"])), dir.path());
        let built = first.ensure("B0001", "u1").await.unwrap();
        drop(first);

        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = cache_with(Arc::clone(&store), dir.path());
        let report = cache.restore().await;
        assert_eq!(report.adopted, 1);
        assert_eq!(report.purged, 0);

        let entry = cache.checkout("B0001", "u1").await.unwrap();
        assert_eq!(entry.index_dir, built.index_dir);
        assert_eq!(entry.metadata.title.as_deref(), Some("Test product"));
        assert_eq!(entry.index.len(), built.index.len());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().builds(), 0);
    }

    #[tokio::test]
    async fn test_restored_entries_expire_and_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let first = cache_with(Arc::new(CountingStore::new(vec!["good"])), dir.path());
        let built = first.ensure("B0001", "u1").await.unwrap();
        drop(first);

        let cache = cache_with(Arc::new(CountingStore::new(vec!["good"])), dir.path());
        assert_eq!(cache.restore().await.adopted, 1);

        let report = cache.evict_expired(Duration::ZERO).await;
        assert_eq!(report.evicted, 1);
        assert!(!built.index_dir.exists());
        assert!(!built.metadata_path.exists());
    }

    #[tokio::test]
    async fn test_restore_purges_unusable_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = cache_with(Arc::new(CountingStore::new(vec!["good"])), dir.path());
        let kept = first.ensure("B0001", "u1").await.unwrap();
        let corrupt = first.ensure("B0002", "u1").await.unwrap();
        let orphan = first.ensure("B0003", "u1").await.unwrap();
        drop(first);

        std::fs::write(&corrupt.metadata_path, b"{ not json").unwrap();
        std::fs::remove_file(&orphan.metadata_path).unwrap();
        let stray = kept.metadata_path.with_file_name("notes.txt");
        std::fs::write(&stray, b"left behind").unwrap();

        let cache = cache_with(Arc::new(CountingStore::new(vec!["good"])), dir.path());
        let report = cache.restore().await;
        assert_eq!(report.adopted, 1);
        assert_eq!(report.purged, 3);
        assert_eq!(report.failed, 0);

        assert!(kept.index_dir.exists());
        assert!(!corrupt.index_dir.exists());
        assert!(!corrupt.metadata_path.exists());
        assert!(!orphan.index_dir.exists());
        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn test_restore_discards_index_from_other_model() {
        struct OtherEmbedding;

        #[async_trait]
        impl EmbeddingClient for OtherEmbedding {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                Ok(vec![1.0, 1.0])
            }

            async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|_| vec![1.0, 1.0]).collect())
            }

            fn model(&self) -> &str {
                "other"
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let first = cache_with(Arc::new(CountingStore::new(vec!["good"])), dir.path());
        let built = first.ensure("B0001", "u1").await.unwrap();
        drop(first);

        let config = CacheConfig {
            root_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = Arc::new(CountingStore::new(vec!["good"]));
        let cache = RetrieverCache::new(&config, Arc::clone(&store) as Arc<dyn ProductStore>, Arc::new(OtherEmbedding));
        let report = cache.restore().await;
        assert_eq!(report.adopted, 0);
        assert_eq!(report.purged, 1);
        assert!(!built.index_dir.exists());

        cache.ensure("B0001", "u1").await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
