//! Response caching for read calls.
//!
//! This module is independent of the remote API:
//! - Entries are keyed by a stable digest of the request (`QueryKey`)
//! - Each entry expires after its own TTL and is evicted on the next lookup
//! - Targeted eviction matches a substring of the rendered request identity
//! - `CacheLayer` puts the rate limiter in front of every network fetch

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use traits::{CachePolicy, QueryKey};
