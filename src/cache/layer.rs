//! Cache layer that orchestrates caching logic with rate-limited fetching.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::storage::ResponseCache;
use super::traits::{CachePolicy, CacheResult, QueryKey};
use crate::limiter::{LimiterError, RateLimiter};
use crate::stats::Stats;

/// Cache layer that decides between the cache and the network.
///
/// Every network fetch passes the rate limiter first and is counted as one
/// API call. Only successful fetches of cacheable requests are stored.
pub struct CacheLayer<V> {
  cache: ResponseCache<V>,
  limiter: RateLimiter,
  stats: Arc<Stats>,
}

impl<V: Clone> CacheLayer<V> {
  pub fn new(max_calls: usize, window: Duration, default_ttl: Duration) -> Result<Self, LimiterError> {
    let stats = Arc::new(Stats::new());
    Ok(Self {
      cache: ResponseCache::new(default_ttl, Arc::clone(&stats)),
      limiter: RateLimiter::new(max_calls, window)?,
      stats,
    })
  }

  pub fn cache(&self) -> &ResponseCache<V> {
    &self.cache
  }

  pub fn limiter(&self) -> &RateLimiter {
    &self.limiter
  }

  pub fn stats(&self) -> &Stats {
    &self.stats
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Cacheable request with a live entry: return it, no network call
  /// 2. Otherwise wait for the rate limiter and call the fetcher
  /// 3. Store a successful result when the request is cacheable
  ///
  /// Failures are returned as-is and never cached.
  pub async fn fetch<K, F, Fut, E>(
    &self,
    key: &K,
    policy: CachePolicy,
    fetcher: F,
  ) -> Result<CacheResult<V>, E>
  where
    K: QueryKey + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
  {
    if policy.is_cacheable() {
      if let Some(cached) = self.cache.lookup(key) {
        return Ok(CacheResult::from_cache(cached.value, cached.cached_at));
      }
    }

    let waited = self.limiter.admit().await;
    if !waited.is_zero() {
      debug!(waited_ms = waited.as_millis() as u64, "Admitted after rate limit wait");
    }
    self.stats.record_api_call();

    let data = fetcher().await?;
    if policy.is_cacheable() {
      self.cache.store(key, data.clone(), policy.ttl());
    }
    Ok(CacheResult::from_network(data))
  }
}
