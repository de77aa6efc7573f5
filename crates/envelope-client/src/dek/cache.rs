//! [`DataKeyCache`]: bounded, time-limited cache of decrypted data keys.
//!
//! Entries are keyed by `SHA-256(encrypted_form ":" canonical(context))`.
//! Expiry is checked lazily on lookup; there is no background sweeper.
//! Eviction picks the entry with the oldest insertion time, which is never
//! refreshed by hits, so under pressure the cache behaves as a FIFO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::protocol::CacheStats;
use common::{ClientError, EncryptionContext};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::key::DekBytes;

/// Default maximum number of cached keys.
pub const MAX_CACHE_SIZE: usize = 100;

/// Default lifetime of a cached key.
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors produced by the cache layer.
///
/// Callers in this crate never propagate these: a failed lookup is a miss and
/// a failed insert is skipped.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The encryption context could not be serialised into a cache key.
    #[error("failed to canonicalise encryption context: {0}")]
    Canonicalise(#[from] serde_json::Error),
}

impl From<CacheError> for ClientError {
    fn from(err: CacheError) -> Self {
        ClientError::Cache(err.to_string())
    }
}

/// Size and lifetime limits for a [`DataKeyCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: CACHE_TTL,
            max_entries: MAX_CACHE_SIZE,
        }
    }
}

type CacheKey = [u8; 32];

#[derive(Debug)]
struct CacheEntry {
    encrypted_form: String,
    plaintext: DekBytes,
    context: EncryptionContext,
    inserted_at: Instant,
    /// Insertion order; breaks ties between equal `inserted_at` values.
    seq: u64,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<CacheKey, CacheEntry>,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct Shared {
    entries: RwLock<Entries>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Thread-safe data key cache.
///
/// Lookups that hit take only a read lock; inserts, evictions and expiry
/// removals take the write lock for a single-entry update. Cloning is cheap
/// and shares the underlying map.
#[derive(Clone, Debug)]
pub struct DataKeyCache {
    inner: Arc<Shared>,
    config: CacheConfig,
}

impl DataKeyCache {
    /// Create an empty cache with the default 24h / 100-entry limits.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Shared::default()),
            config,
        }
    }

    pub fn max_entries(&self) -> usize {
        self.config.max_entries
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Look up the plaintext for `encrypted_form` under `context`.
    ///
    /// Returns an owned copy of the cached key on a hit. An expired entry is
    /// removed and reported as a miss. An entry whose stored context differs
    /// from `context` is reported as a miss but left in place.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Canonicalise`] if the cache key cannot be built;
    /// the request is still counted as a miss.
    pub async fn get(
        &self,
        encrypted_form: &str,
        context: &EncryptionContext,
    ) -> Result<Option<DekBytes>, CacheError> {
        let key = match cache_key(encrypted_form, context) {
            Ok(key) => key,
            Err(e) => {
                self.record_miss();
                return Err(e);
            }
        };

        {
            let entries = self.inner.entries.read().await;
            match entries.map.get(&key) {
                None => {
                    self.record_miss();
                    debug!("data key cache miss");
                    return Ok(None);
                }
                Some(entry) if !self.is_expired(entry) => {
                    if entry.context != *context {
                        self.record_miss();
                        warn!("encryption context mismatch on cached data key; skipping cache");
                        return Ok(None);
                    }
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(hit_rate = self.stats().hit_rate, "data key cache hit");
                    return Ok(Some(entry.plaintext.clone()));
                }
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock, since a concurrent put may
        // have replaced the entry in between.
        let mut entries = self.inner.entries.write().await;
        if entries
            .map
            .get(&key)
            .is_some_and(|entry| self.is_expired(entry))
        {
            entries.map.remove(&key);
            debug!(size = entries.map.len(), "removed expired data key from cache");
        }
        self.record_miss();
        Ok(None)
    }

    /// Peek for a live entry without touching the statistics.
    pub async fn contains(&self, encrypted_form: &str, context: &EncryptionContext) -> bool {
        let Ok(key) = cache_key(encrypted_form, context) else {
            return false;
        };
        let entries = self.inner.entries.read().await;
        entries
            .map
            .get(&key)
            .is_some_and(|entry| !self.is_expired(entry) && entry.context == *context)
    }

    /// Cache an independent copy of `plaintext` under (`encrypted_form`, `context`).
    ///
    /// If the cache is full and the key is new, the entry with the oldest
    /// insertion time is evicted (and wiped) first.
    pub async fn put(
        &self,
        encrypted_form: &str,
        context: &EncryptionContext,
        plaintext: &DekBytes,
    ) -> Result<(), CacheError> {
        if self.config.max_entries == 0 {
            return Ok(());
        }
        let key = cache_key(encrypted_form, context)?;

        let mut entries = self.inner.entries.write().await;
        if !entries.map.contains_key(&key) && entries.map.len() >= self.config.max_entries {
            evict_oldest(&mut entries.map);
        }

        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.map.insert(
            key,
            CacheEntry {
                encrypted_form: encrypted_form.to_owned(),
                plaintext: plaintext.clone(),
                context: context.clone(),
                inserted_at: Instant::now(),
                seq,
            },
        );
        debug!(size = entries.map.len(), "data key added to cache");
        Ok(())
    }

    /// Wipe and drop every entry; optionally reset the counters too.
    pub async fn clear(&self, reset_stats: bool) {
        let mut entries = self.inner.entries.write().await;
        for (_, mut entry) in entries.map.drain() {
            entry.plaintext.erase();
        }
        if reset_stats {
            self.inner.hits.store(0, Ordering::Relaxed);
            self.inner.misses.store(0, Ordering::Relaxed);
        }
        debug!(reset_stats, "data key cache cleared");
    }

    /// Snapshot the hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            let rate = hits as f64 / total_requests as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        };
        CacheStats {
            total_requests,
            hits,
            misses,
            hit_rate,
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        Instant::now().saturating_duration_since(entry.inserted_at) > self.config.ttl
    }

    fn record_miss(&self) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for DataKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(encrypted_form: &str, context: &EncryptionContext) -> Result<CacheKey, CacheError> {
    let canonical = context.canonical()?;
    let mut hasher = Sha256::new();
    hasher.update(encrypted_form.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    Ok(hasher.finalize().into())
}

fn evict_oldest(map: &mut HashMap<CacheKey, CacheEntry>) {
    let oldest = map
        .iter()
        .min_by_key(|(_, entry)| (entry.inserted_at, entry.seq))
        .map(|(key, _)| *key);
    if let Some(key) = oldest {
        if let Some(mut entry) = map.remove(&key) {
            entry.plaintext.erase();
            debug!(
                encrypted_form = %entry.encrypted_form,
                "evicted oldest data key from cache"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    fn key(byte: u8) -> DekBytes {
        DekBytes::from_slice(&[byte; KEY_LEN]).unwrap()
    }

    fn ctx(session: &str) -> EncryptionContext {
        EncryptionContext::for_session("u1", session, 1_700_000_000_000)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = DataKeyCache::new();
        assert!(cache.get("blob", &ctx("s1")).await.unwrap().is_none());
        cache.put("blob", &ctx("s1"), &key(3)).await.unwrap();
        let hit = cache.get("blob", &ctx("s1")).await.unwrap().unwrap();
        assert_eq!(hit.as_bytes(), &[3u8; KEY_LEN]);

        let stats = cache.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
    }

    #[tokio::test]
    async fn stored_copy_is_independent_of_caller_buffer() {
        let cache = DataKeyCache::new();
        let mut original = key(9);
        cache.put("blob", &ctx("s1"), &original).await.unwrap();
        original.erase();
        let cached = cache.get("blob", &ctx("s1")).await.unwrap().unwrap();
        assert_eq!(cached.as_bytes(), &[9u8; KEY_LEN]);
    }

    #[tokio::test]
    async fn different_context_never_hits() {
        let cache = DataKeyCache::new();
        cache.put("blob", &ctx("s1"), &key(1)).await.unwrap();
        assert!(cache.get("blob", &ctx("s2")).await.unwrap().is_none());

        let mut extra = ctx("s1");
        extra.insert("tenant", "acme");
        assert!(cache.get("blob", &extra).await.unwrap().is_none());

        // The original entry is untouched.
        assert_eq!(cache.len().await, 1);
        assert!(cache.contains("blob", &ctx("s1")).await);
    }

    #[tokio::test]
    async fn context_order_does_not_matter() {
        let cache = DataKeyCache::new();
        let a: EncryptionContext = [("userId", "u1"), ("sessionId", "s1")].into_iter().collect();
        let b: EncryptionContext = [("sessionId", "s1"), ("userId", "u1")].into_iter().collect();
        cache.put("blob", &a, &key(4)).await.unwrap();
        assert!(cache.get("blob", &b).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_a_miss_and_removed() {
        let cache = DataKeyCache::with_config(CacheConfig {
            ttl: Duration::from_secs(60),
            max_entries: 10,
        });
        cache.put("blob", &ctx("s1"), &key(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        // Exactly at the TTL boundary the entry is still live.
        assert!(cache.get("blob", &ctx("s1")).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("blob", &ctx("s1")).await.unwrap().is_none());
        assert_eq!(cache.len().await, 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn default_ttl_is_one_day() {
        let cache = DataKeyCache::new();
        cache.put("blob", &ctx("s1"), &key(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(23 * 60 * 60)).await;
        assert!(cache.contains("blob", &ctx("s1")).await);
        tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
        assert!(!cache.contains("blob", &ctx("s1")).await);
    }

    #[tokio::test]
    async fn capacity_evicts_first_inserted() {
        let cache = DataKeyCache::new();
        for i in 0..=MAX_CACHE_SIZE {
            let blob = format!("blob-{i}");
            cache.put(&blob, &ctx("s1"), &key(i as u8)).await.unwrap();
        }
        assert_eq!(cache.len().await, MAX_CACHE_SIZE);
        assert!(!cache.contains("blob-0", &ctx("s1")).await);
        assert!(cache.contains("blob-1", &ctx("s1")).await);
        assert!(cache.contains(&format!("blob-{MAX_CACHE_SIZE}"), &ctx("s1")).await);
    }

    #[tokio::test]
    async fn eviction_ignores_hits() {
        let cache = DataKeyCache::with_config(CacheConfig {
            ttl: CACHE_TTL,
            max_entries: 2,
        });
        cache.put("a", &ctx("s1"), &key(1)).await.unwrap();
        cache.put("b", &ctx("s1"), &key(2)).await.unwrap();
        // A hit on "a" does not protect it from eviction.
        assert!(cache.get("a", &ctx("s1")).await.unwrap().is_some());
        cache.put("c", &ctx("s1"), &key(3)).await.unwrap();
        assert!(!cache.contains("a", &ctx("s1")).await);
        assert!(cache.contains("b", &ctx("s1")).await);
        assert!(cache.contains("c", &ctx("s1")).await);
    }

    #[tokio::test]
    async fn reinserting_existing_key_does_not_evict() {
        let cache = DataKeyCache::with_config(CacheConfig {
            ttl: CACHE_TTL,
            max_entries: 2,
        });
        cache.put("a", &ctx("s1"), &key(1)).await.unwrap();
        cache.put("b", &ctx("s1"), &key(2)).await.unwrap();
        cache.put("b", &ctx("s1"), &key(2)).await.unwrap();
        assert_eq!(cache.len().await, 2);
        assert!(cache.contains("a", &ctx("s1")).await);
    }

    #[tokio::test]
    async fn clear_keeps_or_resets_stats() {
        let cache = DataKeyCache::new();
        cache.put("blob", &ctx("s1"), &key(1)).await.unwrap();
        cache.get("blob", &ctx("s1")).await.unwrap();

        cache.clear(false).await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.stats().hits, 1);

        cache.clear(true).await;
        let stats = cache.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[tokio::test]
    async fn hit_rate_rounds_to_two_decimals() {
        let cache = DataKeyCache::new();
        cache.put("blob", &ctx("s1"), &key(1)).await.unwrap();
        cache.get("blob", &ctx("s1")).await.unwrap();
        cache.get("other", &ctx("s1")).await.unwrap();
        cache.get("other", &ctx("s1")).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.total_requests, stats.hits + stats.misses);
        assert_eq!(stats.hit_rate, 33.33);
    }

    #[test]
    fn cache_error_maps_to_client_error() {
        let json_err = serde_json::from_str::<u8>("not a number").unwrap_err();
        let err: ClientError = CacheError::from(json_err).into();
        assert_eq!(err.code(), "cache_error");
        assert!(err.to_string().contains("canonicalise"));
    }

    #[test]
    fn cache_key_binds_context() {
        let a = cache_key("blob", &ctx("s1")).unwrap();
        let b = cache_key("blob", &ctx("s2")).unwrap();
        let c = cache_key("blob", &ctx("s1")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
