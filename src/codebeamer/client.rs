use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Certificate, Method};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::error::Error as _;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::CachePolicy;
use crate::config::{Config, SslVerify};

/// Result of a single physical API call.
pub type ApiResult = std::result::Result<Value, ApiError>;

/// One physical call against the REST API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  /// Path below the base URL, always starting with `/`
  pub path: String,
  pub query: Map<String, Value>,
  pub body: Option<Value>,
  pub cache: CachePolicy,
}

impl ApiRequest {
  fn new(method: Method, path: impl Into<String>, cache: CachePolicy) -> Self {
    let path = path.into();
    let path = if path.starts_with('/') {
      path
    } else {
      format!("/{}", path)
    };
    Self {
      method,
      path,
      query: Map::new(),
      body: None,
      cache,
    }
  }

  /// Read request, cached with the default TTL.
  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path, CachePolicy::Default)
  }

  /// Write request, never cached.
  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::POST, path, CachePolicy::Bypass).with_body(body)
  }

  pub fn put(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::PUT, path, CachePolicy::Bypass).with_body(body)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path, CachePolicy::Bypass)
  }

  pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
    self.query.insert(key.to_string(), value.into());
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn cache(mut self, cache: CachePolicy) -> Self {
    self.cache = cache;
    self
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Category of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
  /// The server answered with a non-success status
  Status,
  /// The request exceeded the configured timeout
  Timeout,
  /// TLS handshake or certificate verification failed
  Tls,
  /// Connection refused, DNS failure, broken body, ...
  Network,
}

impl ApiErrorKind {
  fn as_str(self) -> &'static str {
    match self {
      ApiErrorKind::Status => "status",
      ApiErrorKind::Timeout => "timeout",
      ApiErrorKind::Tls => "tls",
      ApiErrorKind::Network => "network",
    }
  }
}

/// Structured failure of a physical call.
///
/// Carried as data through composite results rather than aborting them.
/// Serializes as `{"error": true, "kind", "statusCode", "message", "details", ...}`
/// with any JSON object the server returned merged in.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
  pub kind: ApiErrorKind,
  pub status_code: Option<u16>,
  pub message: String,
  pub details: Option<String>,
  /// Fields of the server's JSON error body
  pub server: Map<String, Value>,
}

const RESERVED_KEYS: &[&str] = &["error", "kind", "statusCode", "message", "details"];

impl ApiError {
  /// Non-success HTTP response. A JSON object body is merged into the error.
  pub fn status(status_code: u16, body: &str) -> Self {
    let server = match serde_json::from_str::<Value>(body) {
      Ok(Value::Object(map)) => map,
      _ => Map::new(),
    };
    Self {
      kind: ApiErrorKind::Status,
      status_code: Some(status_code),
      message: format!("API request failed with status {}", status_code),
      details: (!body.is_empty()).then(|| body.to_string()),
      server,
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::bare(ApiErrorKind::Network, message.into())
  }

  pub fn timeout(after: Duration) -> Self {
    Self::bare(
      ApiErrorKind::Timeout,
      format!("Request timed out after {}s", after.as_secs()),
    )
  }

  pub fn tls(details: impl Into<String>) -> Self {
    Self {
      details: Some(details.into()),
      ..Self::bare(
        ApiErrorKind::Tls,
        "SSL verification failed. Try setting CODEBEAMER_SSL_VERIFY=false if using self-signed certs."
          .to_string(),
      )
    }
  }

  fn bare(kind: ApiErrorKind, message: String) -> Self {
    Self {
      kind,
      status_code: None,
      message,
      details: None,
      server: Map::new(),
    }
  }

  fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
    if err.is_timeout() {
      return Self::timeout(timeout);
    }
    // Host names must never reach the classifier
    let err = err.without_url();
    let causes = source_chain(&err);
    let chain = if causes.is_empty() {
      err.to_string()
    } else {
      format!("{}: {}", err, causes)
    };
    if is_tls_failure(err.is_connect(), &causes) {
      return Self::tls(chain);
    }
    Self::network(format!("Network error: {}", chain))
  }
}

impl Serialize for ApiError {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(None)?;
    map.serialize_entry("error", &true)?;
    map.serialize_entry("kind", self.kind.as_str())?;
    if let Some(code) = self.status_code {
      map.serialize_entry("statusCode", &code)?;
    }
    map.serialize_entry("message", &self.message)?;
    if let Some(details) = &self.details {
      map.serialize_entry("details", details)?;
    }
    for (key, value) in &self.server {
      if !RESERVED_KEYS.contains(&key.as_str()) {
        map.serialize_entry(key, value)?;
      }
    }
    map.end()
  }
}

/// Messages of the underlying causes of `err`, outermost first.
fn source_chain(err: &reqwest::Error) -> String {
  let mut causes = Vec::new();
  let mut source = err.source();
  while let Some(cause) = source {
    causes.push(cause.to_string());
    source = cause.source();
  }
  causes.join(": ")
}

/// A TLS failure happens while connecting, and names the TLS layer in one
/// of its causes.
fn is_tls_failure(is_connect: bool, causes: &str) -> bool {
  let lower = causes.to_lowercase();
  is_connect
    && ["certificate", "tls", "ssl", "handshake"]
      .iter()
      .any(|needle| lower.contains(needle))
}

/// Interpret a success body: empty is `null`, unparseable is `{}`.
pub fn parse_payload(body: &[u8]) -> Value {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Value::Null;
  }
  serde_json::from_slice(body).unwrap_or_else(|_| Value::Object(Map::new()))
}

// ============================================================================
// Transport
// ============================================================================

/// The network-facing seam: performs one physical call.
pub trait Transport: Send + Sync {
  fn send(&self, request: &ApiRequest) -> impl Future<Output = ApiResult> + Send;
}

/// Codebeamer REST transport over reqwest.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: String,
  timeout: Duration,
}

impl HttpTransport {
  pub fn new(config: &Config, token: &str) -> Result<Self> {
    let timeout = config.timeout();

    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
      .map_err(|e| eyre!("Invalid API token: {}", e))?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let mut builder = reqwest::Client::builder()
      .timeout(timeout)
      .default_headers(headers);

    builder = match &config.codebeamer.ssl_verify {
      SslVerify::Enabled(true) => builder,
      SslVerify::Enabled(false) => builder.danger_accept_invalid_certs(true),
      SslVerify::CaBundle(path) => {
        let pem = std::fs::read(path)
          .map_err(|e| eyre!("Failed to read CA bundle {}: {}", path.display(), e))?;
        let cert = Certificate::from_pem(&pem)
          .map_err(|e| eyre!("Invalid CA bundle {}: {}", path.display(), e))?;
        builder.add_root_certificate(cert)
      }
    };

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: config.codebeamer.url.trim_end_matches('/').to_string(),
      timeout,
    })
  }

  async fn execute(&self, request: &ApiRequest) -> ApiResult {
    let url = format!("{}{}", self.base_url, request.path);
    debug!(method = %request.method, path = %request.path, "API call");

    let mut builder = self.client.request(request.method.clone(), &url);
    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.to_string());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::from_reqwest(e, self.timeout))?;
    let status = response.status();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| ApiError::from_reqwest(e, self.timeout))?;

    if status.is_success() {
      Ok(parse_payload(&bytes))
    } else {
      let body = String::from_utf8_lossy(&bytes);
      warn!(status = status.as_u16(), path = %request.path, "API error response");
      Err(ApiError::status(status.as_u16(), &body))
    }
  }
}

impl Transport for HttpTransport {
  async fn send(&self, request: &ApiRequest) -> ApiResult {
    self.execute(request).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_path_gets_leading_slash() {
    assert_eq!(ApiRequest::get("v3/projects").path, "/v3/projects");
    assert_eq!(ApiRequest::get("/v3/projects").path, "/v3/projects");
  }

  #[test]
  fn test_reads_cache_writes_bypass() {
    assert_eq!(ApiRequest::get("/v3/items/1").cache, CachePolicy::Default);
    assert_eq!(
      ApiRequest::put("/v3/items/1/fields", json!({})).cache,
      CachePolicy::Bypass
    );
    assert_eq!(ApiRequest::delete("/v3/associations/3").cache, CachePolicy::Bypass);
  }

  #[test]
  fn test_parse_payload_empty_and_malformed() {
    assert_eq!(parse_payload(b""), Value::Null);
    assert_eq!(parse_payload(b"  \n"), Value::Null);
    assert_eq!(parse_payload(b"<html>"), json!({}));
    assert_eq!(parse_payload(br#"{"id": 1}"#), json!({"id": 1}));
  }

  #[test]
  fn test_status_error_merges_server_detail() {
    let err = ApiError::status(400, r#"{"message": "bad field", "resourceUri": "/v3/items/1"}"#);
    let value = serde_json::to_value(&err).unwrap();

    assert_eq!(value["error"], json!(true));
    assert_eq!(value["statusCode"], json!(400));
    assert_eq!(value["kind"], json!("status"));
    assert_eq!(value["message"], json!("API request failed with status 400"));
    assert_eq!(value["resourceUri"], json!("/v3/items/1"));
  }

  #[test]
  fn test_status_error_with_plain_body() {
    let err = ApiError::status(503, "Service Unavailable");
    assert!(err.server.is_empty());
    assert_eq!(err.details.as_deref(), Some("Service Unavailable"));
  }

  #[test]
  fn test_tls_error_shape() {
    let value = serde_json::to_value(ApiError::tls("invalid peer certificate")).unwrap();
    assert_eq!(value["kind"], json!("tls"));
    assert!(value.get("statusCode").is_none());
    assert!(value["message"]
      .as_str()
      .unwrap()
      .contains("CODEBEAMER_SSL_VERIFY"));
  }

  #[test]
  fn test_tls_detection() {
    assert!(is_tls_failure(
      true,
      "client error (Connect): invalid peer certificate: UnknownIssuer"
    ));
    assert!(!is_tls_failure(
      true,
      "client error (Connect): tcp connect error: Connection refused (os error 111)"
    ));
    // Only connection failures qualify
    assert!(!is_tls_failure(false, "error decoding response body: ssl_settings"));
  }

  #[tokio::test]
  async fn test_refused_connection_to_tls_named_host_is_network() {
    // Reserve a local port, then free it so connecting is refused
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = reqwest::Client::builder()
      .no_proxy()
      .resolve("ssl.corp.example", addr)
      .build()
      .unwrap();
    let err = client
      .get(format!("http://ssl.corp.example:{}/v3/projects", addr.port()))
      .send()
      .await
      .unwrap_err();

    let error = ApiError::from_reqwest(err, Duration::from_secs(5));
    assert_eq!(error.kind, ApiErrorKind::Network);
    assert!(error.details.is_none());
    assert!(!error.message.contains("ssl.corp.example"));
  }
}
