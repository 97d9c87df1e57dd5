//! Composite Codebeamer client with transparent caching and rate limiting.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CachePolicy};
use crate::config::Config;
use crate::limiter::LimiterError;
use crate::query::{items_by_id, ItemFilter};
use crate::stats::StatsSnapshot;

use super::api_types::{
  entity_id, extract_list, parent_id, project_fields, Association, FieldUpdate, NewItem,
  QueryRequest, MAX_PAGE_SIZE,
};
use super::cache::{
  item_patterns, FIELD_METADATA_TTL, HIERARCHY_TTL, ITEM_QUERY_PATTERN, PROJECTS_TTL, QUERY_TTL,
};
use super::client::{ApiError, ApiRequest, ApiResult, HttpTransport, Transport};
use super::types::{
  HierarchyTree, ItemContext, ItemQuery, ProjectComplete, SectionErrors, TrackerComplete,
  TreeNode,
};

/// Field ids fetched by `get_tracker_complete` when metadata is requested
/// (test parameters and reusable flag of test case trackers).
const TEST_CASE_FIELDS: [u64; 2] = [10002, 10003];

/// Page size for the scoped item query of `get_project_complete`
const PROJECT_ITEMS_PAGE: u32 = 1000;

/// Limits and TTL used to build a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
  pub max_calls: usize,
  pub window: Duration,
  pub default_ttl: Duration,
}

impl Default for ClientSettings {
  fn default() -> Self {
    Self {
      max_calls: 60,
      window: Duration::from_secs(60),
      default_ttl: Duration::from_secs(300),
    }
  }
}

/// Options of a filtered item query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
  /// When non-empty, items are re-fetched in one batch and reduced to these fields
  pub include_fields: Vec<String>,
  pub max_results: u32,
  pub use_cache: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      include_fields: Vec::new(),
      max_results: 100,
      use_cache: true,
    }
  }
}

/// Sections requested from `get_project_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectScope {
  pub trackers: bool,
  pub items: bool,
  pub wiki: bool,
}

impl Default for ProjectScope {
  fn default() -> Self {
    Self {
      trackers: true,
      items: false,
      wiki: false,
    }
  }
}

/// Sections requested from `get_tracker_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerScope {
  pub items: bool,
  pub fields_metadata: bool,
  pub max_items: u32,
}

impl Default for TrackerScope {
  fn default() -> Self {
    Self {
      items: true,
      fields_metadata: false,
      max_items: 500,
    }
  }
}

/// Sections requested from `get_item_with_context`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextScope {
  pub children: bool,
  pub relations: bool,
  pub parent: bool,
}

/// Codebeamer client that composes endpoint calls into single operations.
///
/// Every physical call goes through the response cache and the rate
/// limiter. Composite operations issue their calls one at a time in a fixed
/// order and report failed sub-calls in the result instead of aborting.
pub struct SmartClient<T = HttpTransport> {
  transport: T,
  cache: CacheLayer<Value>,
}

impl SmartClient<HttpTransport> {
  /// Create a client for the configured Codebeamer instance.
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    let transport = HttpTransport::new(config, &token)?;
    Self::with_transport(transport, config.client_settings())
      .map_err(|e| eyre!("Invalid rate limit configuration: {}", e))
  }
}

impl<T: Transport> SmartClient<T> {
  pub fn with_transport(transport: T, settings: ClientSettings) -> Result<Self, LimiterError> {
    let cache = CacheLayer::new(settings.max_calls, settings.window, settings.default_ttl)?;
    Ok(Self { transport, cache })
  }

  #[cfg(test)]
  pub fn transport(&self) -> &T {
    &self.transport
  }

  /// Route one request through cache, rate limiter and transport.
  async fn call(&self, request: ApiRequest) -> ApiResult {
    let transport = &self.transport;
    let result = self
      .cache
      .fetch(&request, request.cache, || transport.send(&request))
      .await;

    match result {
      Ok(fetched) => {
        if fetched.is_cached() {
          debug!(path = %request.path, cached_at = ?fetched.cached_at, "Served from cache");
        }
        Ok(fetched.data)
      }
      Err(error) => {
        warn!(method = %request.method, path = %request.path, %error, "API call failed");
        Err(error)
      }
    }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// List projects, one page at a time. The page size is capped at 500.
  pub async fn list_projects(&self, page: u32, page_size: u32, use_cache: bool) -> ApiResult {
    let request = ApiRequest::get("/v3/projects")
      .param("page", page)
      .param("pageSize", page_size.min(MAX_PAGE_SIZE))
      .cache(read_policy(use_cache, PROJECTS_TTL));
    self.call(request).await
  }

  /// Run one CbQL query built from `filter`.
  ///
  /// With `include_fields`, the matching items are re-fetched in a single
  /// batched call and reduced to those fields.
  pub async fn query_items(&self, filter: &ItemFilter, options: &QueryOptions) -> ItemQuery {
    let query = filter.to_cbql();
    info!(%query, "Executing CbQL query");

    let body = QueryRequest::first_page(query.clone(), options.max_results).to_value();
    let request =
      ApiRequest::post("/v3/items/query", body).cache(read_policy(options.use_cache, QUERY_TTL));

    let mut result = ItemQuery {
      query,
      ..ItemQuery::default()
    };
    let Some(response) = result.errors.record("query", self.call(request).await) else {
      return result;
    };
    result.total = response.get("total").and_then(Value::as_u64);
    result.items = extract_list(&response);

    if !options.include_fields.is_empty() && !result.items.is_empty() {
      let ids: Vec<u64> = result.items.iter().filter_map(entity_id).collect();
      match self.get_items_batch(&ids, &options.include_fields).await {
        Ok(detailed) => result.items = detailed,
        Err(error) => result.errors.push("details", error),
      }
    }

    result
  }

  /// Fetch several items with one query instead of one call per item.
  pub async fn get_items_batch(
    &self,
    item_ids: &[u64],
    fields: &[String],
  ) -> Result<Vec<Value>, ApiError> {
    if item_ids.is_empty() {
      return Ok(Vec::new());
    }

    let page_size = u32::try_from(item_ids.len()).unwrap_or(u32::MAX);
    let body = QueryRequest::first_page(items_by_id(item_ids), page_size).to_value();
    let response = self
      .call(ApiRequest::post("/v3/items/query", body).cache(CachePolicy::Default))
      .await?;

    let items = extract_list(&response);
    if fields.is_empty() {
      Ok(items)
    } else {
      Ok(
        items
          .into_iter()
          .map(|item| project_fields(item, fields))
          .collect(),
      )
    }
  }

  /// Project, its trackers, and all of their items in at most three calls.
  ///
  /// Items are fetched with one query scoped by the project and every
  /// tracker id; they require the trackers section.
  pub async fn get_project_complete(&self, project_id: u64, scope: ProjectScope) -> ProjectComplete {
    info!(project_id, ?scope, "Fetching complete project");
    let mut result = ProjectComplete::default();

    result.project = result.errors.record(
      "project",
      self
        .call(ApiRequest::get(format!("/v3/projects/{}", project_id)))
        .await,
    );

    if scope.trackers {
      let trackers = self
        .call(ApiRequest::get(format!("/v3/projects/{}/trackers", project_id)))
        .await;
      if let Some(trackers) = result.errors.record("trackers", trackers) {
        result.trackers = extract_list(&trackers);
      }

      let tracker_ids: Vec<u64> = result.trackers.iter().filter_map(entity_id).collect();
      if scope.items && !tracker_ids.is_empty() {
        let filter = ItemFilter::new().projects([project_id]).trackers(tracker_ids);
        let options = QueryOptions {
          max_results: PROJECT_ITEMS_PAGE,
          ..QueryOptions::default()
        };
        let items = self.query_items(&filter, &options).await;
        result.items = items.items;
        result.errors.extend_as("items", items.errors);
      }
    }

    if scope.wiki {
      debug!(project_id, "Wiki pages are not listed by the API; section left empty");
    }

    if !result.errors.is_empty() {
      warn!(
        project_id,
        failed = ?result.errors.sections().collect::<Vec<_>>(),
        "Project fetched with failed sections"
      );
    }

    result
  }

  /// Tracker, its items via one query, and optionally field metadata.
  pub async fn get_tracker_complete(&self, tracker_id: u64, scope: TrackerScope) -> TrackerComplete {
    info!(tracker_id, ?scope, "Fetching complete tracker");
    let mut result = TrackerComplete::default();

    result.tracker = result.errors.record(
      "tracker",
      self
        .call(ApiRequest::get(format!("/v3/trackers/{}", tracker_id)))
        .await,
    );

    if scope.items {
      let filter = ItemFilter::new().trackers([tracker_id]);
      let options = QueryOptions {
        max_results: scope.max_items,
        ..QueryOptions::default()
      };
      let items = self.query_items(&filter, &options).await;
      result.items = items.items;
      result.errors.extend_as("items", items.errors);
    }

    if scope.fields_metadata {
      for field_id in TEST_CASE_FIELDS {
        let request = ApiRequest::get(format!("/v3/trackers/{}/fields/{}", tracker_id, field_id))
          .cache(CachePolicy::Ttl(FIELD_METADATA_TTL));
        let section = format!("fields/{}", field_id);
        if let Some(meta) = result.errors.record(section, self.call(request).await) {
          result.fields_metadata.insert(field_id, meta);
        }
      }
    }

    result
  }

  /// Item with its children, relations and parent, each gated by `scope`.
  ///
  /// The parent is only fetched when the item references one.
  pub async fn get_item_with_context(&self, item_id: u64, scope: ContextScope) -> ItemContext {
    let mut result = ItemContext::default();

    result.item = result.errors.record(
      "item",
      self
        .call(ApiRequest::get(format!("/v3/items/{}", item_id)))
        .await,
    );

    if scope.children {
      let children = self
        .call(ApiRequest::get(format!("/v3/items/{}/children", item_id)))
        .await;
      if let Some(children) = result.errors.record("children", children) {
        result.children = extract_list(&children);
      }
    }

    if scope.relations {
      let relations = self
        .call(ApiRequest::get(format!("/v3/items/{}/relations", item_id)))
        .await;
      result.relations = result.errors.record("relations", relations);
    }

    if scope.parent {
      if let Some(parent) = result.item.as_ref().and_then(parent_id) {
        let response = self
          .call(ApiRequest::get(format!("/v3/items/{}", parent)))
          .await;
        result.parent = result.errors.record("parent", response);
      }
    }

    result
  }

  /// Tracker hierarchy expanded one level per call, down to `max_depth`.
  ///
  /// No call is made at a depth of `max_depth` or more, so `max_depth = 0`
  /// returns an empty tree without touching the network.
  pub async fn get_hierarchy_tree(&self, tracker_id: u64, max_depth: u32) -> HierarchyTree {
    let mut errors = SectionErrors::default();
    let tree = self
      .build_tree(
        format!("/v3/trackers/{}/children", tracker_id),
        0,
        max_depth,
        &mut errors,
      )
      .await;

    let result = HierarchyTree {
      tracker_id,
      tree,
      errors,
    };
    info!(
      tracker_id,
      max_depth,
      nodes = result.node_count(),
      failed = result.errors.len(),
      "Built hierarchy tree"
    );
    result
  }

  fn build_tree<'a>(
    &'a self,
    path: String,
    depth: u32,
    max_depth: u32,
    errors: &'a mut SectionErrors,
  ) -> BoxFuture<'a, Vec<TreeNode>> {
    async move {
      if depth >= max_depth {
        return Vec::new();
      }

      let request = ApiRequest::get(path.clone()).cache(CachePolicy::Ttl(HIERARCHY_TTL));
      let Some(response) = errors.record(path, self.call(request).await) else {
        return Vec::new();
      };

      let mut nodes = Vec::new();
      for child in extract_list(&response) {
        let Value::Object(mut item) = child else {
          continue;
        };
        item.remove("children");
        let children = match item.get("id").and_then(Value::as_u64) {
          Some(id) => {
            self
              .build_tree(format!("/v3/items/{}/children", id), depth + 1, max_depth, errors)
              .await
          }
          None => Vec::new(),
        };
        nodes.push(TreeNode { item, children });
      }
      nodes
    }
    .boxed()
  }

  // ==========================================================================
  // Mutations (never cached)
  // ==========================================================================

  pub async fn create_item(&self, item: &NewItem) -> ApiResult {
    info!(tracker_id = item.tracker_id, "Creating item");
    let request = ApiRequest::post(format!("/v3/trackers/{}/items", item.tracker_id), item.to_body());
    let result = self.call(request).await;
    self.evict_item_queries();
    result
  }

  /// Update fields of one item, then evict every cached view of it.
  pub async fn update_item(
    &self,
    item_id: u64,
    fields: Map<String, Value>,
    clear_cache: bool,
  ) -> ApiResult {
    info!(item_id, "Updating item fields");
    let request = ApiRequest::put(format!("/v3/items/{}/fields", item_id), Value::Object(fields));
    let result = self.call(request).await;
    if clear_cache {
      self.evict_items([item_id]);
    }
    result
  }

  /// Update several items with one call.
  pub async fn bulk_update_items(&self, updates: &[FieldUpdate]) -> ApiResult {
    info!(count = updates.len(), "Bulk updating items");
    let request = ApiRequest::put("/v3/items/fields", json!({ "updates": updates }));
    let result = self.call(request).await;
    self.evict_items(updates.iter().map(|update| update.item_id));
    result
  }

  pub async fn manage_associations(&self, action: &Association) -> ApiResult {
    let request = match action {
      Association::Create {
        from_item_id,
        to_item_id,
        kind,
      } => ApiRequest::post(
        "/v3/associations",
        Association::create_body(*from_item_id, *to_item_id, kind.as_deref()),
      ),
      Association::Get { item_id } => ApiRequest::get(format!("/v3/items/{}/relations", item_id)),
      Association::Delete { association_id } => {
        ApiRequest::delete(format!("/v3/associations/{}", association_id))
      }
    };
    let result = self.call(request).await;

    if let Association::Create {
      from_item_id,
      to_item_id,
      ..
    } = action
    {
      self.evict_items([*from_item_id, *to_item_id]);
    }
    result
  }

  /// Render wiki markup to HTML in the context of a project.
  pub async fn convert_wiki_to_html(&self, project_id: u64, markup: &str) -> Result<String, ApiError> {
    let request = ApiRequest::post(
      format!("/v3/projects/{}/wiki2html", project_id),
      json!({ "content": markup }),
    );
    let response = self.call(request).await?;
    Ok(
      response
        .get("html")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
    )
  }

  // ==========================================================================
  // Cache and statistics
  // ==========================================================================

  fn evict_item_queries(&self) -> usize {
    let evicted = self.cache.cache().evict_matching(ITEM_QUERY_PATTERN);
    debug!(evicted, "Evicted cached item queries");
    evicted
  }

  /// Evict every cached view of the given items, and every cached item
  /// query since any of them may list a changed item.
  fn evict_items(&self, item_ids: impl IntoIterator<Item = u64>) {
    let cache = self.cache.cache();
    let mut evicted = self.evict_item_queries();
    for item_id in item_ids {
      evicted += item_patterns(item_id)
        .iter()
        .map(|pattern| cache.evict_matching(pattern))
        .sum::<usize>();
    }
    debug!(evicted, "Evicted cached item views");
  }

  /// Clear cache entries whose request identity contains `pattern`, or the
  /// whole cache without a pattern. Returns the number of removed entries.
  pub fn clear_cache(&self, pattern: Option<&str>) -> usize {
    let removed = match pattern {
      Some(pattern) => self.cache.cache().evict_matching(pattern),
      None => self.cache.cache().clear(),
    };
    info!(?pattern, removed, "Cleared cache");
    removed
  }

  pub fn stats(&self) -> StatsSnapshot {
    self
      .cache
      .stats()
      .snapshot(self.cache.cache().len(), self.cache.limiter().remaining())
  }

  /// Whether a live cache entry exists for `request`. Counts as a lookup.
  #[cfg(test)]
  fn is_cached(&self, request: &ApiRequest) -> bool {
    self.cache.cache().lookup(request).is_some()
  }
}

fn read_policy(use_cache: bool, ttl: Duration) -> CachePolicy {
  if use_cache {
    CachePolicy::Ttl(ttl)
  } else {
    CachePolicy::Bypass
  }
}
