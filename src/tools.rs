//! Tool catalogue, argument validation and dispatch onto the client.
//!
//! Each tool maps to exactly one client operation. The front end does no
//! caching or rate limiting of its own.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::codebeamer::api_types::{Association, FieldUpdate, NewItem};
use crate::codebeamer::{
  ContextScope, ProjectScope, QueryOptions, SmartClient, TrackerScope, Transport,
};
use crate::query::{FilterValue, ItemFilter};

#[derive(Debug, Clone)]
pub struct Tool {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
  /// JSON schema of the tool's arguments
  pub schema: fn() -> Value,
}

impl Tool {
  /// Catalogue entry as listed to clients.
  pub fn describe(&self) -> Value {
    json!({
      "name": self.name,
      "description": self.description,
      "inputSchema": (self.schema)(),
    })
  }
}

/// All available tools
pub const TOOLS: &[Tool] = &[
  Tool {
    name: "codebeamer_list_projects",
    aliases: &["projects", "list_projects"],
    description: "List available projects. Usually the first call, to discover project ids.",
    schema: list_projects_schema,
  },
  Tool {
    name: "codebeamer_query_items",
    aliases: &["query", "query_items"],
    description: "Search items with a single CbQL query built from structured filters.",
    schema: query_items_schema,
  },
  Tool {
    name: "codebeamer_get_project_complete",
    aliases: &["project", "project_complete"],
    description: "Project, its trackers and all their items in at most three calls.",
    schema: project_complete_schema,
  },
  Tool {
    name: "codebeamer_get_tracker_complete",
    aliases: &["tracker", "tracker_complete"],
    description: "Tracker with its items and optional field metadata.",
    schema: tracker_complete_schema,
  },
  Tool {
    name: "codebeamer_get_items_batch",
    aliases: &["batch", "items_batch"],
    description: "Fetch several items by id in one call.",
    schema: items_batch_schema,
  },
  Tool {
    name: "codebeamer_get_item_with_context",
    aliases: &["item", "item_context"],
    description: "Item with optional children, relations and parent.",
    schema: item_context_schema,
  },
  Tool {
    name: "codebeamer_create_item",
    aliases: &["create", "create_item"],
    description: "Create a new tracker item.",
    schema: create_item_schema,
  },
  Tool {
    name: "codebeamer_update_item",
    aliases: &["update", "update_item"],
    description: "Update fields of an existing item and drop its cached views.",
    schema: update_item_schema,
  },
  Tool {
    name: "codebeamer_bulk_update_items",
    aliases: &["bulk_update"],
    description: "Update several items in a single call.",
    schema: bulk_update_schema,
  },
  Tool {
    name: "codebeamer_manage_associations",
    aliases: &["associations", "assoc"],
    description: "Create, read or delete associations between items.",
    schema: associations_schema,
  },
  Tool {
    name: "codebeamer_get_hierarchy_tree",
    aliases: &["tree", "hierarchy"],
    description: "Hierarchy of a tracker's items down to a maximum depth.",
    schema: hierarchy_schema,
  },
  Tool {
    name: "codebeamer_convert_wiki",
    aliases: &["wiki", "wiki2html"],
    description: "Render wiki markup to HTML in the context of a project.",
    schema: convert_wiki_schema,
  },
  Tool {
    name: "codebeamer_get_stats",
    aliases: &["stats"],
    description: "API call, cache and rate limit statistics.",
    schema: empty_schema,
  },
  Tool {
    name: "codebeamer_clear_cache",
    aliases: &["clear", "clear_cache"],
    description: "Clear the response cache, optionally only entries matching a pattern.",
    schema: clear_cache_schema,
  },
];

/// Find a tool by exact name or alias.
pub fn find_tool(name: &str) -> Option<&'static Tool> {
  let name = name.to_lowercase();
  TOOLS
    .iter()
    .find(|tool| tool.name == name || tool.aliases.contains(&name.as_str()))
}

/// Get suggestions for a (possibly misspelled) tool name, best first
pub fn get_suggestions(input: &str) -> Vec<&'static Tool> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return TOOLS.iter().collect();
  }

  let mut matches: Vec<(&Tool, u32)> = Vec::new();

  for tool in TOOLS {
    if tool.name == input_lower {
      matches.push((tool, 0));
      continue;
    }

    if tool.aliases.contains(&input_lower.as_str()) {
      matches.push((tool, 1));
      continue;
    }

    if tool.name.starts_with(&input_lower) {
      matches.push((tool, 2));
      continue;
    }

    if tool.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((tool, 3));
      continue;
    }

    // Misspelled full names usually share a long prefix with the real one
    if input_lower.starts_with(tool.name) || tool.name.contains(&input_lower) {
      matches.push((tool, 4));
      continue;
    }

    if tool.aliases.iter().any(|a| a.contains(&input_lower)) {
      matches.push((tool, 5));
    }
  }

  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(tool, _)| tool).collect()
}

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DispatchError {
  #[error("Unknown tool: {name}")]
  UnknownTool {
    name: String,
    suggestions: Vec<&'static str>,
  },

  #[error("Invalid arguments for {tool}: {reason}")]
  InvalidArguments { tool: &'static str, reason: String },

  #[error("Missing argument '{argument}' for {tool}")]
  MissingArgument {
    tool: &'static str,
    argument: &'static str,
  },
}

fn default_true() -> bool {
  true
}

fn default_page() -> u32 {
  1
}

fn default_page_size() -> u32 {
  100
}

fn default_max_items() -> u32 {
  500
}

fn default_max_depth() -> u32 {
  3
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListProjectsArgs {
  #[serde(default = "default_page")]
  pub page: u32,
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default = "default_true")]
  pub use_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryItemsArgs {
  #[serde(default)]
  pub project_ids: Vec<u64>,
  #[serde(default)]
  pub tracker_ids: Vec<u64>,
  #[serde(default)]
  pub tracker_names: Vec<String>,
  #[serde(default)]
  pub item_types: Vec<String>,
  #[serde(default)]
  pub statuses: Vec<String>,
  #[serde(default)]
  pub custom_filters: BTreeMap<String, FilterValue>,
  #[serde(default)]
  pub include_fields: Vec<String>,
  #[serde(default = "default_page_size")]
  pub max_results: u32,
  #[serde(default = "default_true")]
  pub use_cache: bool,
}

impl QueryItemsArgs {
  fn filter(&self) -> ItemFilter {
    let filter = ItemFilter::new()
      .projects(self.project_ids.iter().copied())
      .trackers(self.tracker_ids.iter().copied())
      .tracker_names(self.tracker_names.iter().cloned())
      .item_types(self.item_types.iter().cloned())
      .statuses(self.statuses.iter().cloned());

    self
      .custom_filters
      .iter()
      .fold(filter, |filter, (field, value)| {
        filter.custom(field.as_str(), value.clone())
      })
  }

  fn options(&self) -> QueryOptions {
    QueryOptions {
      include_fields: self.include_fields.clone(),
      max_results: self.max_results,
      use_cache: self.use_cache,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectCompleteArgs {
  pub project_id: u64,
  #[serde(default = "default_true")]
  pub include_trackers: bool,
  #[serde(default)]
  pub include_items: bool,
  #[serde(default)]
  pub include_wiki: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerCompleteArgs {
  pub tracker_id: u64,
  #[serde(default = "default_true")]
  pub include_items: bool,
  #[serde(default)]
  pub include_fields_metadata: bool,
  #[serde(default = "default_max_items")]
  pub max_items: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemsBatchArgs {
  pub item_ids: Vec<u64>,
  #[serde(default)]
  pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemContextArgs {
  pub item_id: u64,
  #[serde(default)]
  pub include_children: bool,
  #[serde(default)]
  pub include_relations: bool,
  #[serde(default)]
  pub include_parent: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateItemArgs {
  pub tracker_id: u64,
  pub summary: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub fields: Map<String, Value>,
  #[serde(default)]
  pub parent_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateItemArgs {
  pub item_id: u64,
  pub fields: Map<String, Value>,
  #[serde(default = "default_true")]
  pub clear_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkUpdateArgs {
  pub updates: Vec<FieldUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationAction {
  Create,
  Get,
  Delete,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssociationArgs {
  pub action: AssociationAction,
  #[serde(default)]
  pub from_item_id: Option<u64>,
  #[serde(default)]
  pub to_item_id: Option<u64>,
  #[serde(default)]
  pub association_id: Option<u64>,
  #[serde(default)]
  pub association_type: Option<String>,
}

impl AssociationArgs {
  /// Check that the fields the action needs are present.
  fn into_association(self, tool: &'static str) -> Result<Association, DispatchError> {
    let require = |value: Option<u64>, argument: &'static str| {
      value.ok_or(DispatchError::MissingArgument { tool, argument })
    };

    Ok(match self.action {
      AssociationAction::Create => Association::Create {
        from_item_id: require(self.from_item_id, "from_item_id")?,
        to_item_id: require(self.to_item_id, "to_item_id")?,
        kind: self.association_type,
      },
      AssociationAction::Get => Association::Get {
        item_id: require(self.from_item_id, "from_item_id")?,
      },
      AssociationAction::Delete => Association::Delete {
        association_id: require(self.association_id, "association_id")?,
      },
    })
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HierarchyArgs {
  pub tracker_id: u64,
  #[serde(default = "default_max_depth")]
  pub max_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvertWikiArgs {
  pub project_id: u64,
  pub wiki_content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClearCacheArgs {
  #[serde(default)]
  pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

/// A validated tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
  ListProjects(ListProjectsArgs),
  QueryItems(QueryItemsArgs),
  GetProjectComplete(ProjectCompleteArgs),
  GetTrackerComplete(TrackerCompleteArgs),
  GetItemsBatch(ItemsBatchArgs),
  GetItemWithContext(ItemContextArgs),
  CreateItem(CreateItemArgs),
  UpdateItem(UpdateItemArgs),
  BulkUpdateItems(BulkUpdateArgs),
  ManageAssociations(Association),
  GetHierarchyTree(HierarchyArgs),
  ConvertWiki(ConvertWikiArgs),
  GetStats,
  ClearCache(ClearCacheArgs),
}

impl ToolCall {
  /// Resolve a tool by name or alias and validate its arguments.
  ///
  /// `null` arguments are treated as an empty object.
  pub fn parse(name: &str, arguments: Value) -> Result<Self, DispatchError> {
    let Some(tool) = find_tool(name) else {
      return Err(DispatchError::UnknownTool {
        name: name.to_string(),
        suggestions: get_suggestions(name).iter().take(3).map(|t| t.name).collect(),
      });
    };
    let arguments = match arguments {
      Value::Null => Value::Object(Map::new()),
      other => other,
    };
    let tool = tool.name;

    Ok(match tool {
      "codebeamer_list_projects" => ToolCall::ListProjects(args(tool, arguments)?),
      "codebeamer_query_items" => ToolCall::QueryItems(args(tool, arguments)?),
      "codebeamer_get_project_complete" => ToolCall::GetProjectComplete(args(tool, arguments)?),
      "codebeamer_get_tracker_complete" => ToolCall::GetTrackerComplete(args(tool, arguments)?),
      "codebeamer_get_items_batch" => ToolCall::GetItemsBatch(args(tool, arguments)?),
      "codebeamer_get_item_with_context" => ToolCall::GetItemWithContext(args(tool, arguments)?),
      "codebeamer_create_item" => ToolCall::CreateItem(args(tool, arguments)?),
      "codebeamer_update_item" => ToolCall::UpdateItem(args(tool, arguments)?),
      "codebeamer_bulk_update_items" => ToolCall::BulkUpdateItems(args(tool, arguments)?),
      "codebeamer_manage_associations" => ToolCall::ManageAssociations(
        args::<AssociationArgs>(tool, arguments)?.into_association(tool)?,
      ),
      "codebeamer_get_hierarchy_tree" => ToolCall::GetHierarchyTree(args(tool, arguments)?),
      "codebeamer_convert_wiki" => ToolCall::ConvertWiki(args(tool, arguments)?),
      "codebeamer_get_stats" => {
        args::<NoArgs>(tool, arguments)?;
        ToolCall::GetStats
      }
      "codebeamer_clear_cache" => ToolCall::ClearCache(args(tool, arguments)?),
      _ => {
        return Err(DispatchError::UnknownTool {
          name: name.to_string(),
          suggestions: Vec::new(),
        })
      }
    })
  }
}

fn args<T: DeserializeOwned>(tool: &'static str, arguments: Value) -> Result<T, DispatchError> {
  serde_json::from_value(arguments).map_err(|e| DispatchError::InvalidArguments {
    tool,
    reason: e.to_string(),
  })
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run a validated call against the client and render its result.
///
/// Failed API calls are rendered as their structured error object.
pub async fn dispatch<T: Transport>(client: &SmartClient<T>, call: ToolCall) -> Value {
  match call {
    ToolCall::ListProjects(a) => api(client.list_projects(a.page, a.page_size, a.use_cache).await),
    ToolCall::QueryItems(a) => render(&client.query_items(&a.filter(), &a.options()).await),
    ToolCall::GetProjectComplete(a) => {
      let scope = ProjectScope {
        trackers: a.include_trackers,
        items: a.include_items,
        wiki: a.include_wiki,
      };
      render(&client.get_project_complete(a.project_id, scope).await)
    }
    ToolCall::GetTrackerComplete(a) => {
      let scope = TrackerScope {
        items: a.include_items,
        fields_metadata: a.include_fields_metadata,
        max_items: a.max_items,
      };
      render(&client.get_tracker_complete(a.tracker_id, scope).await)
    }
    ToolCall::GetItemsBatch(a) => match client.get_items_batch(&a.item_ids, &a.fields).await {
      Ok(items) => Value::Array(items),
      Err(error) => render(&error),
    },
    ToolCall::GetItemWithContext(a) => {
      let scope = ContextScope {
        children: a.include_children,
        relations: a.include_relations,
        parent: a.include_parent,
      };
      render(&client.get_item_with_context(a.item_id, scope).await)
    }
    ToolCall::CreateItem(a) => {
      let item = NewItem {
        tracker_id: a.tracker_id,
        summary: a.summary,
        description: a.description,
        fields: a.fields,
        parent_id: a.parent_id,
      };
      api(client.create_item(&item).await)
    }
    ToolCall::UpdateItem(a) => api(client.update_item(a.item_id, a.fields, a.clear_cache).await),
    ToolCall::BulkUpdateItems(a) => api(client.bulk_update_items(&a.updates).await),
    ToolCall::ManageAssociations(action) => api(client.manage_associations(&action).await),
    ToolCall::GetHierarchyTree(a) => {
      render(&client.get_hierarchy_tree(a.tracker_id, a.max_depth).await)
    }
    ToolCall::ConvertWiki(a) => {
      match client.convert_wiki_to_html(a.project_id, &a.wiki_content).await {
        Ok(html) => json!({ "html": html }),
        Err(error) => render(&error),
      }
    }
    ToolCall::GetStats => render(&client.stats()),
    ToolCall::ClearCache(a) => {
      let removed = client.clear_cache(a.pattern.as_deref());
      let message = match &a.pattern {
        Some(pattern) => format!("Cache cleared for pattern: {}", pattern),
        None => "Cache cleared".to_string(),
      };
      json!({ "message": message, "removed": removed })
    }
  }
}

/// Parse, validate and run one tool invocation.
///
/// Caller mistakes come back as `{"error", "tool", "arguments"}`.
pub async fn handle<T: Transport>(client: &SmartClient<T>, name: &str, arguments: Value) -> Value {
  info!(tool = name, "Tool call");
  match ToolCall::parse(name, arguments.clone()) {
    Ok(call) => dispatch(client, call).await,
    Err(error) => {
      warn!(tool = name, %error, "Rejected tool call");
      let mut envelope = json!({
        "error": error.to_string(),
        "tool": name,
        "arguments": arguments,
      });
      if let DispatchError::UnknownTool { suggestions, .. } = &error {
        if !suggestions.is_empty() {
          envelope["suggestions"] = json!(suggestions);
        }
      }
      envelope
    }
  }
}

fn api(result: crate::codebeamer::ApiResult) -> Value {
  match result {
    Ok(value) => value,
    Err(error) => render(&error),
  }
}

fn render<S: Serialize>(value: &S) -> Value {
  serde_json::to_value(value).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

// ============================================================================
// Schemas
// ============================================================================

fn int_array(description: &str) -> Value {
  json!({ "type": "array", "items": { "type": "integer" }, "description": description })
}

fn string_array(description: &str) -> Value {
  json!({ "type": "array", "items": { "type": "string" }, "description": description })
}

fn list_projects_schema() -> Value {
  json!({
    "type": "object",
    "properties": {
      "page": { "type": "integer", "default": 1, "description": "Page number (1-indexed)" },
      "page_size": { "type": "integer", "default": 100, "description": "Projects per page (1-500)" },
      "use_cache": { "type": "boolean", "default": true }
    }
  })
}

fn query_items_schema() -> Value {
  json!({
    "type": "object",
    "properties": {
      "project_ids": int_array("Filter by project ids"),
      "tracker_ids": int_array("Filter by tracker ids"),
      "tracker_names": string_array("Filter by tracker names, e.g. ['Bugs', 'Tasks']"),
      "item_types": string_array("Filter by item types, e.g. ['Bug', 'Task']"),
      "statuses": string_array("Filter by statuses, e.g. ['Open', 'In Progress']"),
      "custom_filters": {
        "type": "object",
        "description": "Field filters, e.g. {'priority': 'High', 'assignee.name': ['Ann', 'Bo']}"
      },
      "include_fields": string_array("Reduce each item to these fields (fetched in one batch)"),
      "max_results": { "type": "integer", "default": 100 },
      "use_cache": { "type": "boolean", "default": true }
    }
  })
}

fn project_complete_schema() -> Value {
  json!({
    "type": "object",
    "required": ["project_id"],
    "properties": {
      "project_id": { "type": "integer" },
      "include_trackers": { "type": "boolean", "default": true },
      "include_items": { "type": "boolean", "default": false, "description": "Requires include_trackers" },
      "include_wiki": { "type": "boolean", "default": false }
    }
  })
}

fn tracker_complete_schema() -> Value {
  json!({
    "type": "object",
    "required": ["tracker_id"],
    "properties": {
      "tracker_id": { "type": "integer" },
      "include_items": { "type": "boolean", "default": true },
      "include_fields_metadata": { "type": "boolean", "default": false },
      "max_items": { "type": "integer", "default": 500 }
    }
  })
}

fn items_batch_schema() -> Value {
  json!({
    "type": "object",
    "required": ["item_ids"],
    "properties": {
      "item_ids": int_array("Item ids to fetch"),
      "fields": string_array("Only keep these fields")
    }
  })
}

fn item_context_schema() -> Value {
  json!({
    "type": "object",
    "required": ["item_id"],
    "properties": {
      "item_id": { "type": "integer" },
      "include_children": { "type": "boolean", "default": false },
      "include_relations": { "type": "boolean", "default": false },
      "include_parent": { "type": "boolean", "default": false }
    }
  })
}

fn create_item_schema() -> Value {
  json!({
    "type": "object",
    "required": ["tracker_id", "summary"],
    "properties": {
      "tracker_id": { "type": "integer" },
      "summary": { "type": "string" },
      "description": { "type": "string" },
      "fields": { "type": "object", "description": "Additional fields, e.g. {'priority': 'High'}" },
      "parent_id": { "type": "integer" }
    }
  })
}

fn update_item_schema() -> Value {
  json!({
    "type": "object",
    "required": ["item_id", "fields"],
    "properties": {
      "item_id": { "type": "integer" },
      "fields": { "type": "object", "description": "e.g. {'status': 'Done'}" },
      "clear_cache": { "type": "boolean", "default": true }
    }
  })
}

fn bulk_update_schema() -> Value {
  json!({
    "type": "object",
    "required": ["updates"],
    "properties": {
      "updates": {
        "type": "array",
        "items": {
          "type": "object",
          "properties": {
            "itemId": { "type": "integer" },
            "fields": { "type": "object" }
          }
        }
      }
    }
  })
}

fn associations_schema() -> Value {
  json!({
    "type": "object",
    "required": ["action"],
    "properties": {
      "action": { "type": "string", "enum": ["create", "get", "delete"] },
      "from_item_id": { "type": "integer", "description": "Source item (create, get)" },
      "to_item_id": { "type": "integer", "description": "Target item (create)" },
      "association_id": { "type": "integer", "description": "Association to delete" },
      "association_type": { "type": "string", "description": "e.g. 'depends_on', defaults to 'related'" }
    }
  })
}

fn hierarchy_schema() -> Value {
  json!({
    "type": "object",
    "required": ["tracker_id"],
    "properties": {
      "tracker_id": { "type": "integer" },
      "max_depth": { "type": "integer", "default": 3 }
    }
  })
}

fn convert_wiki_schema() -> Value {
  json!({
    "type": "object",
    "required": ["project_id", "wiki_content"],
    "properties": {
      "project_id": { "type": "integer" },
      "wiki_content": { "type": "string" }
    }
  })
}

fn clear_cache_schema() -> Value {
  json!({
    "type": "object",
    "properties": {
      "pattern": { "type": "string", "description": "Only clear entries whose request contains this text, e.g. '/items/'" }
    }
  })
}

fn empty_schema() -> Value {
  json!({ "type": "object", "properties": {} })
}
