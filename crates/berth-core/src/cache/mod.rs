//! Fingerprint-keyed build cache.
//!
//! [`BuildCache`] enforces write-once semantics over a pluggable
//! [`CacheStorage`]: storing the same artifact twice is a no-op, storing a
//! different artifact under a recorded fingerprint is a
//! [`BerthError::CacheConflict`]. Lookups only report presence.

pub mod fs;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::Artifact;
use crate::error::{BerthError, Result};
use crate::fingerprint::Fingerprint;
use crate::metrics::METRICS;

/// Backing storage for cache records.
///
/// Implementations only need to be consistent for a single key; write-once
/// checks happen in [`BuildCache`].
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>>;

    async fn put(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<()>;
}

/// In-process storage backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    records: Mutex<HashMap<Fingerprint, Artifact>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        let records = self
            .records
            .lock()
            .map_err(|_| BerthError::Storage("cache lock poisoned".to_string()))?;
        Ok(records.get(fingerprint).cloned())
    }

    async fn put(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| BerthError::Storage("cache lock poisoned".to_string()))?;
        records.insert(fingerprint.clone(), artifact.clone());
        Ok(())
    }
}

/// Result of [`BuildCache::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutcome {
    /// The fingerprint was new and is now recorded.
    Recorded,
    /// An equal artifact was already recorded.
    Unchanged,
}

/// Hit/miss counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
}

/// Write-once artifact cache keyed by fingerprint.
pub struct BuildCache {
    storage: Arc<dyn CacheStorage>,
    /// Serialises check-then-write in `store`; lookups never take it.
    write_lock: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl BuildCache {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self {
            storage,
            write_lock: tokio::sync::Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Cache over a fresh [`MemoryCacheStorage`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStorage::new()))
    }

    /// Report the artifact recorded for `fingerprint`, if any.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Artifact>> {
        let found = self.storage.get(fingerprint).await?;
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            METRICS.inc_cache_hits();
            debug!(fingerprint = %fingerprint.short(), "cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            METRICS.inc_cache_misses();
            debug!(fingerprint = %fingerprint.short(), "cache miss");
        }
        Ok(found)
    }

    /// Record `artifact` under `fingerprint`.
    ///
    /// Idempotent for equal artifacts; a different artifact for a recorded
    /// fingerprint is rejected with [`BerthError::CacheConflict`].
    pub async fn store(
        &self,
        fingerprint: &Fingerprint,
        artifact: Artifact,
    ) -> Result<StoreOutcome> {
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.storage.get(fingerprint).await? {
            if existing == artifact {
                return Ok(StoreOutcome::Unchanged);
            }
            return Err(BerthError::CacheConflict {
                fingerprint: fingerprint.clone(),
                existing: existing.to_string(),
                offered: artifact.to_string(),
            });
        }

        self.storage.put(fingerprint, &artifact).await?;
        self.stores.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint.short(), artifact = %artifact, "cache record stored");
        Ok(StoreOutcome::Recorded)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(seed: &str) -> Fingerprint {
        Fingerprint::from_bytes(seed.as_bytes())
    }

    #[tokio::test]
    async fn test_store_then_lookup_returns_artifact() {
        let cache = BuildCache::in_memory();
        let artifact = Artifact::new("deps", "sha256:aaa");
        cache.store(&fp("deps"), artifact.clone()).await.unwrap();
        assert_eq!(cache.lookup(&fp("deps")).await.unwrap(), Some(artifact));
    }

    #[tokio::test]
    async fn test_lookup_missing_is_none() {
        let cache = BuildCache::in_memory();
        assert_eq!(cache.lookup(&fp("nothing")).await.unwrap(), None);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_equal_store_is_noop() {
        let cache = BuildCache::in_memory();
        let artifact = Artifact::new("app", "sha256:bbb");
        let first = cache.store(&fp("app"), artifact.clone()).await.unwrap();
        let second = cache.store(&fp("app"), artifact).await.unwrap();
        assert_eq!(first, StoreOutcome::Recorded);
        assert_eq!(second, StoreOutcome::Unchanged);
        assert_eq!(cache.stats().stores, 1);
    }

    #[tokio::test]
    async fn test_conflicting_store_is_rejected() {
        let cache = BuildCache::in_memory();
        cache
            .store(&fp("app"), Artifact::new("app", "sha256:one"))
            .await
            .unwrap();
        let err = cache
            .store(&fp("app"), Artifact::new("app", "sha256:two"))
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::CacheConflict { .. }));

        // The original record survives.
        let kept = cache.lookup(&fp("app")).await.unwrap().unwrap();
        assert_eq!(kept.digest, "sha256:one");
    }

    #[tokio::test]
    async fn test_concurrent_stores_record_once() {
        let cache = Arc::new(BuildCache::in_memory());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache
                    .store(&fp("shared"), Artifact::new("shared", "sha256:same"))
                    .await
            }));
        }
        let mut recorded = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() == StoreOutcome::Recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
    }
}
