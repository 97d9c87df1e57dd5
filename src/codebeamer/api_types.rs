//! Serde types for Codebeamer V3 request bodies and response helpers.
//!
//! Responses are kept as `serde_json::Value`; only the handful of fields
//! the composite operations navigate (ids, parent refs, item lists) are read.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Largest page size the API accepts
pub const MAX_PAGE_SIZE: u32 = 500;

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueryRequest {
  pub query_string: String,
  pub page: u32,
  pub page_size: u32,
}

impl QueryRequest {
  pub fn first_page(query_string: String, page_size: u32) -> Self {
    Self {
      query_string,
      page: 1,
      page_size,
    }
  }

  pub fn to_value(&self) -> Value {
    json!({
      "queryString": self.query_string,
      "page": self.page,
      "pageSize": self.page_size,
    })
  }
}

/// Fields of a new tracker item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewItem {
  pub tracker_id: u64,
  pub summary: String,
  pub description: Option<String>,
  /// Additional fields, merged over the standard ones
  pub fields: Map<String, Value>,
  pub parent_id: Option<u64>,
}

impl NewItem {
  pub fn to_body(&self) -> Value {
    let mut body = Map::new();
    body.insert("tracker".into(), reference(self.tracker_id));
    body.insert("summary".into(), Value::String(self.summary.clone()));
    if let Some(description) = self.description.as_ref().filter(|d| !d.is_empty()) {
      body.insert("description".into(), Value::String(description.clone()));
    }
    body.extend(self.fields.clone());
    if let Some(parent_id) = self.parent_id {
      body.insert("parent".into(), reference(parent_id));
    }
    Value::Object(body)
  }
}

/// One entry of a bulk field update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldUpdate {
  pub item_id: u64,
  #[serde(default)]
  pub fields: Map<String, Value>,
}

/// Association operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Association {
  Create {
    from_item_id: u64,
    to_item_id: u64,
    kind: Option<String>,
  },
  /// Read the relations of an item
  Get { item_id: u64 },
  Delete { association_id: u64 },
}

impl Association {
  pub fn create_body(from_item_id: u64, to_item_id: u64, kind: Option<&str>) -> Value {
    json!({
      "from": reference(from_item_id),
      "to": reference(to_item_id),
      "type": kind.unwrap_or("related"),
    })
  }
}

/// `{"id": n}` reference object
pub fn reference(id: u64) -> Value {
  json!({ "id": id })
}

// ============================================================================
// Response helpers
// ============================================================================

/// Keys under which list endpoints wrap their results
const LIST_KEYS: &[&str] = &["items", "itemRefs", "references"];

/// Extract a list of entities from a response that is either a bare array
/// or an object wrapping one. Anything else yields an empty list.
pub fn extract_list(value: &Value) -> Vec<Value> {
  match value {
    Value::Array(items) => items.clone(),
    Value::Object(map) => LIST_KEYS
      .iter()
      .find_map(|key| map.get(*key).and_then(Value::as_array))
      .cloned()
      .unwrap_or_default(),
    _ => Vec::new(),
  }
}

/// Numeric `id` of an entity.
pub fn entity_id(value: &Value) -> Option<u64> {
  value.get("id").and_then(Value::as_u64)
}

/// Id of the item's parent, when the item references one.
pub fn parent_id(item: &Value) -> Option<u64> {
  item.get("parent").and_then(entity_id)
}

/// Keep only `id` and the requested fields of an entity.
pub fn project_fields(item: Value, fields: &[String]) -> Value {
  match item {
    Value::Object(map) => Value::Object(
      map
        .into_iter()
        .filter(|(key, _)| key == "id" || fields.iter().any(|f| f == key))
        .collect(),
    ),
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_extract_list_shapes() {
    assert_eq!(extract_list(&json!([{"id": 1}])).len(), 1);
    assert_eq!(extract_list(&json!({"items": [{"id": 1}, {"id": 2}]})).len(), 2);
    assert_eq!(extract_list(&json!({"itemRefs": [{"id": 3}]})).len(), 1);
    assert!(extract_list(&json!({"total": 0})).is_empty());
    assert!(extract_list(&Value::Null).is_empty());
  }

  #[test]
  fn test_parent_id() {
    assert_eq!(parent_id(&json!({"id": 5, "parent": {"id": 1}})), Some(1));
    assert_eq!(parent_id(&json!({"id": 5})), None);
    assert_eq!(parent_id(&json!({"id": 5, "parent": null})), None);
  }

  #[test]
  fn test_new_item_body() {
    let mut fields = Map::new();
    fields.insert("priority".into(), json!("High"));
    let item = NewItem {
      tracker_id: 50,
      summary: "New bug".into(),
      description: Some("Steps".into()),
      fields,
      parent_id: Some(7),
    };

    assert_eq!(
      item.to_body(),
      json!({
        "tracker": {"id": 50},
        "summary": "New bug",
        "description": "Steps",
        "priority": "High",
        "parent": {"id": 7},
      })
    );
  }

  #[test]
  fn test_new_item_omits_empty_description() {
    let item = NewItem {
      tracker_id: 1,
      summary: "s".into(),
      description: Some(String::new()),
      ..NewItem::default()
    };
    assert!(item.to_body().get("description").is_none());
  }

  #[test]
  fn test_association_defaults_to_related() {
    let body = Association::create_body(1, 2, None);
    assert_eq!(body["type"], json!("related"));
    assert_eq!(body["to"], json!({"id": 2}));
  }

  #[test]
  fn test_project_fields_keeps_id() {
    let item = json!({"id": 1, "name": "x", "priority": "High", "status": "Open"});
    let projected = project_fields(item, &["priority".to_string()]);
    assert_eq!(projected, json!({"id": 1, "priority": "High"}));
  }

  #[test]
  fn test_field_update_wire_names() {
    let update: FieldUpdate =
      serde_json::from_value(json!({"itemId": 9, "fields": {"status": "Done"}})).unwrap();
    assert_eq!(update.item_id, 9);
    assert_eq!(serde_json::to_value(&update).unwrap()["itemId"], json!(9));
  }
}
