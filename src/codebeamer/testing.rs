//! Recording transport double for client tests.

use reqwest::Method;
use std::sync::Mutex;

use super::client::{ApiError, ApiRequest, ApiResult, Transport};

struct Route {
  method: Method,
  path: String,
  /// Only match requests whose rendered body contains this text
  body_contains: Option<String>,
  result: ApiResult,
}

/// Transport that answers from canned routes and records every call.
///
/// Routes are matched in registration order; unmatched requests get a 404.
#[derive(Default)]
pub struct StubTransport {
  routes: Vec<Route>,
  calls: Mutex<Vec<ApiRequest>>,
}

impl StubTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on(mut self, method: Method, path: &str, result: ApiResult) -> Self {
    self.routes.push(Route {
      method,
      path: path.to_string(),
      body_contains: None,
      result,
    });
    self
  }

  /// Answer `POST /v3/items/query` when the query body contains `needle`.
  pub fn on_query(mut self, needle: &str, result: ApiResult) -> Self {
    self.routes.push(Route {
      method: Method::POST,
      path: "/v3/items/query".to_string(),
      body_contains: Some(needle.to_string()),
      result,
    });
    self
  }

  pub fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().map(|c| c.clone()).unwrap_or_default()
  }

  pub fn call_count(&self) -> usize {
    self.calls().len()
  }

  pub fn paths(&self) -> Vec<String> {
    self.calls().into_iter().map(|r| r.path).collect()
  }

  fn answer(&self, request: &ApiRequest) -> ApiResult {
    let body = request
      .body
      .as_ref()
      .map(|b| b.to_string())
      .unwrap_or_default();

    self
      .routes
      .iter()
      .find(|route| {
        route.method == request.method
          && route.path == request.path
          && route
            .body_contains
            .as_ref()
            .map_or(true, |needle| body.contains(needle.as_str()))
      })
      .map(|route| route.result.clone())
      .unwrap_or_else(|| Err(ApiError::status(404, "")))
  }
}

impl Transport for StubTransport {
  async fn send(&self, request: &ApiRequest) -> ApiResult {
    if let Ok(mut calls) = self.calls.lock() {
      calls.push(request.clone());
    }
    self.answer(request)
  }
}
