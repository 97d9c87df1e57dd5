//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A request that can be looked up in the response cache.
///
/// Two logically identical requests must produce the same `cache_hash`.
/// The `description` is the human-readable request identity that targeted
/// eviction patterns are matched against.
pub trait QueryKey {
  /// Stable, fixed-length digest used as the storage key
  fn cache_hash(&self) -> String;

  /// Rendered request identity (e.g. `GET /v3/items/42 {} null`)
  fn description(&self) -> String;
}

/// A value served from the cache, with the wall-clock time it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<V> {
  pub value: V,
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_cached(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Live entry from the response cache
  Cache,
}

/// How a request interacts with the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
  /// Never read from or write to the cache (mutations)
  Bypass,
  /// Cache with the cache's default TTL
  Default,
  /// Cache with an explicit TTL
  Ttl(Duration),
}

impl CachePolicy {
  pub fn is_cacheable(self) -> bool {
    !matches!(self, CachePolicy::Bypass)
  }

  /// Explicit TTL override, if any.
  pub fn ttl(self) -> Option<Duration> {
    match self {
      CachePolicy::Ttl(ttl) => Some(ttl),
      _ => None,
    }
  }
}
