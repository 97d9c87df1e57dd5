//! Usage counters shared between the cache and the client.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free call and cache counters.
#[derive(Debug, Default)]
pub struct Stats {
  api_calls: AtomicU64,
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
}

impl Stats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_api_call(&self) {
    self.api_calls.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_hit(&self) {
    self.cache_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_miss(&self) {
    self.cache_misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn api_calls(&self) -> u64 {
    self.api_calls.load(Ordering::Relaxed)
  }

  pub fn cache_hits(&self) -> u64 {
    self.cache_hits.load(Ordering::Relaxed)
  }

  pub fn cache_misses(&self) -> u64 {
    self.cache_misses.load(Ordering::Relaxed)
  }

  /// Snapshot the counters together with the cache and limiter gauges.
  pub fn snapshot(&self, cache_size: usize, remaining_calls: usize) -> StatsSnapshot {
    StatsSnapshot {
      api_calls: self.api_calls(),
      cache_hits: self.cache_hits(),
      cache_misses: self.cache_misses(),
      cache_hit_rate: hit_rate(self.cache_hits(), self.cache_misses()),
      cache_size,
      remaining_calls_in_window: remaining_calls,
    }
  }
}

/// Point-in-time statistics readout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
  pub api_calls: u64,
  pub cache_hits: u64,
  pub cache_misses: u64,
  /// Hits over lookups, 0.0 when nothing was looked up yet
  pub cache_hit_rate: f64,
  pub cache_size: usize,
  pub remaining_calls_in_window: usize,
}

#[allow(clippy::cast_precision_loss)]
fn hit_rate(hits: u64, misses: u64) -> f64 {
  let total = hits + misses;
  if total == 0 {
    0.0
  } else {
    hits as f64 / total as f64
  }
}
