use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::client::{ApiError, ApiResult};

/// A failed section of a composite result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionError {
  /// Which sub-call failed (e.g. "trackers", "items", an endpoint path)
  pub section: String,
  pub error: ApiError,
}

/// Failures collected while assembling a composite result.
///
/// An empty section without an entry here was either not requested or
/// returned nothing; a failed section always has an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SectionErrors(Vec<SectionError>);

impl SectionErrors {
  /// Unwrap a sub-result, recording its failure under `section`.
  pub fn record(&mut self, section: impl Into<String>, result: ApiResult) -> Option<Value> {
    match result {
      Ok(value) => Some(value),
      Err(error) => {
        self.push(section, error);
        None
      }
    }
  }

  pub fn push(&mut self, section: impl Into<String>, error: ApiError) {
    self.0.push(SectionError {
      section: section.into(),
      error,
    });
  }

  /// Take over the failures of a nested operation, filed under `section`.
  pub fn extend_as(&mut self, section: &str, other: SectionErrors) {
    self.0.extend(other.0.into_iter().map(|failure| SectionError {
      section: section.to_string(),
      error: failure.error,
    }));
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn sections(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(|e| e.section.as_str())
  }
}

/// Result of a filtered item query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ItemQuery {
  /// The CbQL expression that was sent
  pub query: String,
  pub total: Option<u64>,
  pub items: Vec<Value>,
  pub errors: SectionErrors,
}

/// Project with its trackers and items
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectComplete {
  pub project: Option<Value>,
  pub trackers: Vec<Value>,
  pub items: Vec<Value>,
  pub wiki_pages: Vec<Value>,
  pub errors: SectionErrors,
}

/// Tracker with its items and field metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerComplete {
  pub tracker: Option<Value>,
  pub items: Vec<Value>,
  pub fields_metadata: BTreeMap<u64, Value>,
  pub errors: SectionErrors,
}

/// Item with children, relations and parent
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ItemContext {
  pub item: Option<Value>,
  pub children: Vec<Value>,
  pub relations: Option<Value>,
  pub parent: Option<Value>,
  pub errors: SectionErrors,
}

/// Node of a hierarchy tree: the entity's own fields plus its children
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeNode {
  #[serde(flatten)]
  pub item: Map<String, Value>,
  pub children: Vec<TreeNode>,
}

/// Tracker hierarchy down to a bounded depth
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HierarchyTree {
  pub tracker_id: u64,
  pub tree: Vec<TreeNode>,
  pub errors: SectionErrors,
}

impl HierarchyTree {
  /// Total number of nodes in the tree.
  pub fn node_count(&self) -> usize {
    fn count(nodes: &[TreeNode]) -> usize {
      nodes.iter().map(|n| 1 + count(&n.children)).sum()
    }
    count(&self.tree)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_absent_sections_serialize_as_empty() {
    let value = serde_json::to_value(ProjectComplete::default()).unwrap();
    assert_eq!(
      value,
      json!({
        "project": null,
        "trackers": [],
        "items": [],
        "wiki_pages": [],
        "errors": [],
      })
    );
  }

  #[test]
  fn test_record_keeps_failure() {
    let mut errors = SectionErrors::default();
    assert_eq!(errors.record("ok", Ok(json!(1))), Some(json!(1)));
    assert_eq!(errors.record("bad", Err(ApiError::network("down"))), None);

    assert_eq!(errors.len(), 1);
    assert_eq!(errors.sections().collect::<Vec<_>>(), vec!["bad"]);
  }

  #[test]
  fn test_extend_as_files_nested_failures_under_one_section() {
    let mut nested = SectionErrors::default();
    nested.push("query", ApiError::status(500, "Internal Error"));
    nested.push("details", ApiError::network("down"));

    let mut errors = SectionErrors::default();
    errors.push("project", ApiError::status(404, ""));
    errors.extend_as("items", nested);

    assert_eq!(
      errors.sections().collect::<Vec<_>>(),
      vec!["project", "items", "items"]
    );
  }

  #[test]
  fn test_tree_node_flattens_item() {
    let mut item = Map::new();
    item.insert("id".into(), json!(3));
    let node = TreeNode {
      item,
      children: Vec::new(),
    };
    assert_eq!(serde_json::to_value(node).unwrap(), json!({"id": 3, "children": []}));
  }
}
