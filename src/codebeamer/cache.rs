//! Cache keys and TTL policy for Codebeamer requests.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::cache::QueryKey;

use super::client::ApiRequest;

/// Project listings rarely change
pub const PROJECTS_TTL: Duration = Duration::from_secs(600);
/// Query results go stale faster than entity reads
pub const QUERY_TTL: Duration = Duration::from_secs(180);
/// Field metadata is effectively static
pub const FIELD_METADATA_TTL: Duration = Duration::from_secs(3600);
pub const HIERARCHY_TTL: Duration = Duration::from_secs(600);

impl QueryKey for ApiRequest {
  fn cache_hash(&self) -> String {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    let query = canonical_json(&Value::Object(self.query.clone()));
    let body = self
      .body
      .as_ref()
      .map(canonical_json)
      .unwrap_or_else(|| "null".to_string());
    format!("{} {} {} {}", self.method, self.path, query, body)
  }
}

/// Cache patterns covering every cached view of one item: the item itself
/// and its sub-resources (children, relations, fields, ...).
pub fn item_patterns(item_id: u64) -> [String; 2] {
  [format!("/items/{} ", item_id), format!("/items/{}/", item_id)]
}

/// Matches every cached item query, including the batched item fetches.
/// A query result may hold any item, so these go whenever an item changes.
pub const ITEM_QUERY_PATTERN: &str = "POST /v3/items/query ";

/// Render JSON with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let fields: Vec<String> = keys
        .into_iter()
        .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
        .collect();
      format!("{{{}}}", fields.join(","))
    }
    Value::Array(items) => {
      let items: Vec<String> = items.iter().map(canonical_json).collect();
      format!("[{}]", items.join(","))
    }
    other => other.to_string(),
  }
}
