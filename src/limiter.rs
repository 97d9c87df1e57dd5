//! Sliding-window rate limiter for outbound API calls.
//!
//! The limiter never rejects a call. When the trailing window is full it
//! suspends the caller until the oldest recorded call falls out of the
//! window, then admits it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Added to every computed wait so the oldest call is strictly outside the
/// window when the waiter re-checks.
const SAFETY_MARGIN: Duration = Duration::from_millis(100);

/// Invalid limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
  #[error("maximum calls per window must be positive")]
  InvalidMaximum,
  #[error("rate window must be longer than zero")]
  InvalidWindow,
}

/// Bounds admitted calls to `max_calls` per trailing `window`.
#[derive(Debug)]
pub struct RateLimiter {
  max_calls: usize,
  window: Duration,
  /// Admission instants inside the trailing window, oldest first
  calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
  pub fn new(max_calls: usize, window: Duration) -> Result<Self, LimiterError> {
    if max_calls == 0 {
      return Err(LimiterError::InvalidMaximum);
    }
    if window.is_zero() {
      return Err(LimiterError::InvalidWindow);
    }
    Ok(Self {
      max_calls,
      window,
      calls: Mutex::new(VecDeque::with_capacity(max_calls)),
    })
  }

  fn calls(&self) -> MutexGuard<'_, VecDeque<Instant>> {
    self.calls.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn prune(&self, calls: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = calls.front() {
      if now.saturating_duration_since(*oldest) >= self.window {
        calls.pop_front();
      } else {
        break;
      }
    }
  }

  /// Wait until a call may be made, then record it.
  ///
  /// Returns the total time spent waiting. The lock is released while
  /// sleeping; after each sleep the window is pruned and checked again.
  pub async fn admit(&self) -> Duration {
    let started = Instant::now();

    loop {
      let wait = {
        let now = Instant::now();
        let mut calls = self.calls();
        self.prune(&mut calls, now);

        if calls.len() < self.max_calls {
          calls.push_back(now);
          return now.saturating_duration_since(started);
        }

        match calls.front() {
          Some(oldest) => (*oldest + self.window).saturating_duration_since(now) + SAFETY_MARGIN,
          None => SAFETY_MARGIN,
        }
      };

      warn!(
        wait_ms = wait.as_millis() as u64,
        max_calls = self.max_calls,
        "Rate limit reached, waiting"
      );
      tokio::time::sleep(wait).await;
    }
  }

  /// Calls that can still be admitted without waiting in the current window.
  pub fn remaining(&self) -> usize {
    let mut calls = self.calls();
    self.prune(&mut calls, Instant::now());
    self.max_calls.saturating_sub(calls.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_zero_maximum_rejected() {
    assert_eq!(
      RateLimiter::new(0, Duration::from_secs(60)).unwrap_err(),
      LimiterError::InvalidMaximum
    );
  }

  #[test]
  fn test_zero_window_rejected() {
    assert_eq!(
      RateLimiter::new(5, Duration::ZERO).unwrap_err(),
      LimiterError::InvalidWindow
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_admits_without_wait_under_limit() {
    let limiter = RateLimiter::new(3, Duration::from_secs(60)).unwrap();

    for _ in 0..3 {
      assert_eq!(limiter.admit().await, Duration::ZERO);
    }
    assert_eq!(limiter.remaining(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_blocks_before_call_over_limit() {
    let limiter = RateLimiter::new(2, Duration::from_secs(10)).unwrap();
    let start = Instant::now();

    limiter.admit().await;
    limiter.admit().await;
    let waited = limiter.admit().await;

    assert!(waited >= Duration::from_secs(10));
    assert!(start.elapsed() >= Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_caller_never_waits() {
    let limiter = RateLimiter::new(1, Duration::from_secs(5)).unwrap();

    for _ in 0..4 {
      assert_eq!(limiter.admit().await, Duration::ZERO);
      tokio::time::advance(Duration::from_secs(6)).await;
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_window_never_exceeds_maximum() {
    let max = 3;
    let window = Duration::from_secs(60);
    let limiter = RateLimiter::new(max, window).unwrap();

    let mut admitted = Vec::new();
    for _ in 0..10 {
      limiter.admit().await;
      admitted.push(Instant::now());
    }

    for (i, start) in admitted.iter().enumerate() {
      let in_window = admitted[i..]
        .iter()
        .filter(|t| t.saturating_duration_since(*start) < window)
        .count();
      assert!(in_window <= max, "{} calls inside one window", in_window);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_remaining_recovers_after_window() {
    let limiter = RateLimiter::new(2, Duration::from_secs(30)).unwrap();
    limiter.admit().await;
    limiter.admit().await;
    assert_eq!(limiter.remaining(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(limiter.remaining(), 2);
  }
}
