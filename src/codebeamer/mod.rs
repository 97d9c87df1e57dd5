pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use cached_client::{
  ClientSettings, ContextScope, ProjectScope, QueryOptions, SmartClient, TrackerScope,
};
pub use client::{ApiResult, Transport};
