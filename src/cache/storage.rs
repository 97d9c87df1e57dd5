//! In-memory response storage with per-entry expiry.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{CachedValue, QueryKey};
use crate::stats::Stats;

struct CacheEntry<V> {
  value: V,
  /// Monotonic store time, drives expiry
  stored_at: Instant,
  /// Wall-clock store time, reported to callers
  cached_at: DateTime<Utc>,
  ttl: Duration,
  /// Request identity, matched by targeted eviction
  identity: String,
}

impl<V> CacheEntry<V> {
  fn is_live(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.stored_at) <= self.ttl
  }

  fn matches(&self, hash: &str, pattern: &str) -> bool {
    self.identity.contains(pattern) || hash.contains(pattern)
  }
}

/// Key/value response cache keyed by request fingerprint.
///
/// Every `lookup` counts exactly one hit or one miss in the shared [`Stats`].
/// The map is guarded by a single lock that is only held for the duration
/// of one lookup, store or eviction.
pub struct ResponseCache<V> {
  entries: Mutex<HashMap<String, CacheEntry<V>>>,
  default_ttl: Duration,
  stats: Arc<Stats>,
}

impl<V: Clone> ResponseCache<V> {
  pub fn new(default_ttl: Duration, stats: Arc<Stats>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      default_ttl,
      stats,
    }
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Return the live entry for `key`, evicting it first if it has expired.
  pub fn lookup<K: QueryKey + ?Sized>(&self, key: &K) -> Option<CachedValue<V>> {
    let hash = key.cache_hash();
    let now = Instant::now();
    let mut entries = self.entries();

    let live = match entries.get(&hash) {
      Some(entry) if entry.is_live(now) => Some(CachedValue {
        value: entry.value.clone(),
        cached_at: entry.cached_at,
      }),
      Some(_) => {
        entries.remove(&hash);
        debug!(key = %short(&hash), "Evicted expired cache entry");
        None
      }
      None => None,
    };
    drop(entries);

    match live {
      Some(cached) => {
        self.stats.record_hit();
        debug!(key = %short(&hash), "Cache hit");
        Some(cached)
      }
      None => {
        self.stats.record_miss();
        None
      }
    }
  }

  /// Store `value` under `key`, replacing any previous entry.
  ///
  /// `ttl` of `None` uses the cache's default TTL. Expired entries are
  /// purged on every store, so keys that are never read again do not pile up.
  pub fn store<K: QueryKey + ?Sized>(&self, key: &K, value: V, ttl: Option<Duration>) {
    let now = Instant::now();
    let entry = CacheEntry {
      value,
      stored_at: now,
      cached_at: Utc::now(),
      ttl: ttl.unwrap_or(self.default_ttl),
      identity: key.description(),
    };

    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    let purged = before - entries.len();
    if purged > 0 {
      debug!(purged, "Purged expired cache entries");
    }
    entries.insert(key.cache_hash(), entry);
  }

  /// Remove every entry whose request identity or hash contains `pattern`.
  pub fn evict_matching(&self, pattern: &str) -> usize {
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|hash, entry| !entry.matches(hash, pattern));
    let evicted = before - entries.len();
    debug!(pattern, evicted, "Evicted cache entries by pattern");
    evicted
  }

  /// Drop the entire cache, returning how many entries were removed.
  pub fn clear(&self) -> usize {
    let mut entries = self.entries();
    let count = entries.len();
    entries.clear();
    count
  }

  /// Number of stored entries. Entries that expired since the last store
  /// are counted until the next store or lookup of their key.
  pub fn len(&self) -> usize {
    self.entries().len()
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn short(hash: &str) -> &str {
  hash.get(..8).unwrap_or(hash)
}
