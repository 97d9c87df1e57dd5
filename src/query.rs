//! CbQL filter expression builder.
//!
//! Turns structured filter criteria into a single query string for the
//! `/v3/items/query` endpoint. Expressions are assembled here, never parsed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;

/// Predicate that matches every item. Returned when no filter is given so
/// callers never send an empty query string.
pub const MATCH_ALL: &str = "project.id > 0";

/// Value of a custom field filter: a single value or a set of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
  Many(Vec<Value>),
  One(Value),
}

impl From<&str> for FilterValue {
  fn from(value: &str) -> Self {
    FilterValue::One(Value::String(value.to_string()))
  }
}

impl From<Vec<&str>> for FilterValue {
  fn from(values: Vec<&str>) -> Self {
    FilterValue::Many(values.into_iter().map(Value::from).collect())
  }
}

/// Structured item filter criteria.
///
/// Custom filters live in a sorted map, so two filters with the same
/// content always render the same expression (and the same cache key).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilter {
  pub project_ids: Vec<u64>,
  pub tracker_ids: Vec<u64>,
  pub tracker_names: Vec<String>,
  pub item_types: Vec<String>,
  pub statuses: Vec<String>,
  pub custom: BTreeMap<String, FilterValue>,
}

impl ItemFilter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn projects(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
    self.project_ids.extend(ids);
    self
  }

  pub fn trackers(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
    self.tracker_ids.extend(ids);
    self
  }

  pub fn tracker_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
    self.tracker_names.extend(names.into_iter().map(Into::into));
    self
  }

  pub fn item_types<S: Into<String>>(mut self, types: impl IntoIterator<Item = S>) -> Self {
    self.item_types.extend(types.into_iter().map(Into::into));
    self
  }

  pub fn statuses<S: Into<String>>(mut self, statuses: impl IntoIterator<Item = S>) -> Self {
    self.statuses.extend(statuses.into_iter().map(Into::into));
    self
  }

  pub fn custom(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
    self.custom.insert(field.into(), value.into());
    self
  }

  /// Render the filter as a CbQL expression.
  ///
  /// Predicates appear in a fixed order (projects, trackers, tracker names,
  /// types, statuses, then custom fields by name) joined with `AND`.
  pub fn to_cbql(&self) -> String {
    let mut conditions = Vec::new();

    if !self.project_ids.is_empty() {
      conditions.push(in_list("project.id", &self.project_ids, bare));
    }
    if !self.tracker_ids.is_empty() {
      conditions.push(in_list("tracker.id", &self.tracker_ids, bare));
    }
    if !self.tracker_names.is_empty() {
      conditions.push(in_list("tracker.name", &self.tracker_names, quoted));
    }
    if !self.item_types.is_empty() {
      conditions.push(in_list("type", &self.item_types, quoted));
    }
    if !self.statuses.is_empty() {
      conditions.push(in_list("status", &self.statuses, quoted));
    }

    for (field, value) in &self.custom {
      match value {
        FilterValue::Many(values) => {
          let rendered: Vec<String> = values.iter().map(scalar_text).collect();
          conditions.push(in_list(field, &rendered, quoted));
        }
        FilterValue::One(value) => {
          conditions.push(format!("{} = {}", field, quoted(&scalar_text(value))));
        }
      }
    }

    if conditions.is_empty() {
      MATCH_ALL.to_string()
    } else {
      conditions.join(" AND ")
    }
  }
}

/// Expression selecting exactly the given item ids.
pub fn items_by_id(ids: &[u64]) -> String {
  in_list("item.id", ids, bare)
}

fn in_list<T>(field: &str, values: &[T], render: impl Fn(&T) -> String) -> String {
  let rendered: Vec<String> = values.iter().map(render).collect();
  format!("{} IN ({})", field, rendered.join(", "))
}

fn bare<T: Display>(value: &T) -> String {
  value.to_string()
}

fn quoted<T: AsRef<str>>(value: &T) -> String {
  format!("'{}'", value.as_ref().replace('\'', "\\'"))
}

/// Strings render without JSON quotes; everything else as JSON text.
fn scalar_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
