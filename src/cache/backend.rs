//! Cache storage seam and the bundled in-memory backend.
//!
//! [`CacheBackend`] is a key-value contract (get/put/delete with TTL) so an
//! external store can hold entries shared across gateway processes.
//! [`MemoryCacheBackend`] is the default: a moka cache with LRU eviction and
//! per-entry expiry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use moka::Expiry;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::{Completion, Fingerprint};

/// A stored completion with its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub completion: Completion,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// New entry created now, expiring after `ttl`.
    pub fn new(completion: Completion, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            completion,
            created_at,
            expires_at,
        }
    }

    /// Whether the entry is logically absent at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Key-value store behind the response cache.
///
/// Failures are reported as [`PromptgateError::CacheUnavailable`](crate::PromptgateError::CacheUnavailable);
/// the response cache degrades to bypass rather than failing the request.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite. Overwriting resets the TTL.
    async fn put(&self, key: &Fingerprint, entry: CacheEntry, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &Fingerprint) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    /// Persist or settle pending writes. Called on gateway shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Approximate number of live entries.
    fn entry_count(&self) -> u64;
}

#[derive(Clone)]
struct Stored {
    entry: CacheEntry,
    ttl: Duration,
}

/// Per-entry TTL: every create or overwrite restarts the clock.
struct EntryTtl;

impl Expiry<Fingerprint, Stored> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &Stored,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &Fingerprint,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-memory backend over moka with LRU eviction.
pub struct MemoryCacheBackend {
    cache: Cache<Fingerprint, Stored>,
}

impl MemoryCacheBackend {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryTtl)
            .build();
        Self { cache }
    }

    /// Apply pending evictions and expirations now.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.cache.get(key).await.map(|s| s.entry))
    }

    async fn put(&self, key: &Fingerprint, entry: CacheEntry, ttl: Duration) -> Result<()> {
        self.cache.insert(key.clone(), Stored { entry, ttl }).await;
        Ok(())
    }

    async fn delete(&self, key: &Fingerprint) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
