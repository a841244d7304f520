//! Response cache keyed on request fingerprints.
//!
//! [`ResponseCache`] sits in front of the dispatcher. A hit bypasses
//! budgeting, provider selection and retries entirely. Cache hit/miss
//! metrics are emitted here.
//!
//! # Expiry
//!
//! Entries carry their own `expires_at`. Reads that observe an expired
//! entry treat it as a miss but leave it in place, since a fresh write may
//! already have replaced it. Removal is the backend's job: moka evicts
//! expired entries during its own maintenance. There is no sweep thread.
//!
//! # Degradation
//!
//! A failing backend never fails the request: reads report a miss, writes
//! are dropped, and both log a warning and bump
//! [`CACHE_DEGRADED_TOTAL`](crate::telemetry::CACHE_DEGRADED_TOTAL).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::backend::{CacheBackend, CacheEntry, MemoryCacheBackend};
use crate::telemetry;
use crate::types::{Completion, Fingerprint};
use crate::PromptgateError;

/// Configuration for the response cache.
///
/// ```rust
/// # use promptgate::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached entries. Default: 10,000.
    pub max_entries: u64,
    /// Default time-to-live for cached entries. Default: 1 hour.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the time-to-live for cached entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Fingerprint-addressed store of completed responses.
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ResponseCache {
    /// Create a cache over the in-memory backend.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_backend(Arc::new(MemoryCacheBackend::new(config.max_entries)), config)
    }

    /// Create a cache over a custom backend. `config.max_entries` is left to
    /// the backend.
    pub fn with_backend(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            ttl: config.ttl,
        }
    }

    /// Default TTL applied by [`store`](Self::store).
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a live entry. Expired entries and backend failures are misses.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let found = self.lookup(fingerprint).await;
        if found.is_some() {
            debug!(fingerprint = fingerprint.short(), "cache hit");
            metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
        } else {
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        }
        found
    }

    /// [`get`](Self::get) without hit/miss accounting, for internal re-checks.
    pub(crate) async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let found = match self.backend.get(fingerprint).await {
            Ok(found) => found,
            Err(e) => {
                degraded("get", &e);
                None
            }
        };

        match found {
            Some(entry) if entry.is_expired() => {
                debug!(fingerprint = fingerprint.short(), "expired cache entry");
                None
            }
            other => other,
        }
    }

    /// Insert or overwrite with an explicit TTL. Last write wins.
    pub async fn put(&self, fingerprint: &Fingerprint, completion: Completion, ttl: Duration) {
        let entry = CacheEntry::new(completion, ttl);
        if let Err(e) = self.backend.put(fingerprint, entry, ttl).await {
            degraded("put", &e);
        }
    }

    /// Insert or overwrite with the configured default TTL.
    pub async fn store(&self, fingerprint: &Fingerprint, completion: Completion) {
        self.put(fingerprint, completion, self.ttl).await;
    }

    /// Whether a live entry exists. Does not emit hit/miss metrics.
    pub async fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lookup(fingerprint).await.is_some()
    }

    pub async fn invalidate(&self, fingerprint: &Fingerprint) {
        if let Err(e) = self.backend.delete(fingerprint).await {
            degraded("invalidate", &e);
        }
    }

    pub async fn invalidate_all(&self) {
        if let Err(e) = self.backend.clear().await {
            degraded("invalidate", &e);
        }
    }

    /// Settle pending backend work. Called on shutdown.
    pub async fn flush(&self) {
        if let Err(e) = self.backend.flush().await {
            degraded("flush", &e);
        }
    }

    /// Approximate number of entries held by the backend.
    pub fn entry_count(&self) -> u64 {
        self.backend.entry_count()
    }
}

fn degraded(operation: &'static str, err: &PromptgateError) {
    warn!(operation, error = %err, "cache backend unavailable, bypassing");
    metrics::counter!(telemetry::CACHE_DEGRADED_TOTAL, "operation" => operation).increment(1);
}
