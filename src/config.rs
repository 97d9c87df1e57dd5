use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::codebeamer::ClientSettings;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub codebeamer: CodebeamerConfig,
  pub limits: LimitsConfig,
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CodebeamerConfig {
  /// Base URL of the instance, without the `/v3` suffix
  pub url: String,
  pub ssl_verify: SslVerify,
  pub timeout_secs: u64,
}

impl Default for CodebeamerConfig {
  fn default() -> Self {
    Self {
      url: "https://your-codebeamer.com".to_string(),
      ssl_verify: SslVerify::default(),
      timeout_secs: 30,
    }
  }
}

/// TLS certificate verification mode.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SslVerify {
  /// Verify against the system roots, or skip verification entirely
  Enabled(bool),
  /// Verify against an additional CA bundle (PEM)
  CaBundle(PathBuf),
}

impl Default for SslVerify {
  fn default() -> Self {
    SslVerify::Enabled(true)
  }
}

impl SslVerify {
  /// Parse `true`/`false` (any case), anything else is a bundle path.
  fn parse(value: &str) -> Self {
    match value.trim().to_lowercase().as_str() {
      "true" => SslVerify::Enabled(true),
      "false" => SslVerify::Enabled(false),
      _ => SslVerify::CaBundle(PathBuf::from(value.trim())),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
  /// Calls allowed per rolling window
  pub max_calls: usize,
  pub window_secs: u64,
}

impl Default for LimitsConfig {
  fn default() -> Self {
    Self {
      max_calls: 60,
      window_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 300,
    }
  }
}

impl Config {
  /// Load configuration from file, then apply environment overrides.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cbgate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cbgate/config.yaml
  ///
  /// Without a file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        debug!("No configuration file found, using defaults");
        Config::default()
      }
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cbgate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cbgate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
  }

  /// Override file values with `CODEBEAMER_*` environment variables.
  pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(url) = var("CODEBEAMER_URL") {
      self.codebeamer.url = url;
    }
    if let Some(value) = var("CODEBEAMER_MAX_CALLS") {
      self.limits.max_calls = parse_number("CODEBEAMER_MAX_CALLS", &value)?;
    }
    if let Some(value) = var("CODEBEAMER_CACHE_TTL") {
      self.cache.default_ttl_secs = parse_number("CODEBEAMER_CACHE_TTL", &value)?;
    }
    if let Some(value) = var("CODEBEAMER_TIMEOUT") {
      self.codebeamer.timeout_secs = parse_number("CODEBEAMER_TIMEOUT", &value)?;
    }
    if let Some(value) = var("CODEBEAMER_SSL_VERIFY") {
      self.codebeamer.ssl_verify = SslVerify::parse(&value);
    }
    Ok(())
  }

  pub fn validate(&self) -> Result<()> {
    url::Url::parse(&self.codebeamer.url)
      .map_err(|e| eyre!("Invalid Codebeamer URL '{}': {}", self.codebeamer.url, e))?;
    if self.limits.max_calls == 0 {
      return Err(eyre!("limits.max_calls must be greater than zero"));
    }
    if self.limits.window_secs == 0 {
      return Err(eyre!("limits.window_secs must be greater than zero"));
    }
    Ok(())
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.codebeamer.timeout_secs)
  }

  pub fn client_settings(&self) -> ClientSettings {
    ClientSettings {
      max_calls: self.limits.max_calls,
      window: Duration::from_secs(self.limits.window_secs),
      default_ttl: Duration::from_secs(self.cache.default_ttl_secs),
    }
  }

  /// Get the Codebeamer API token from environment variables.
  ///
  /// Checks CBGATE_API_KEY first, then CODEBEAMER_API_KEY as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("CBGATE_API_KEY")
      .or_else(|_| std::env::var("CODEBEAMER_API_KEY"))
      .ok()
      .filter(|token| !token.is_empty())
      .ok_or_else(|| {
        eyre!("Codebeamer API token not found. Set CBGATE_API_KEY or CODEBEAMER_API_KEY environment variable.")
      })
  }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
  value
    .trim()
    .parse()
    .map_err(|_| eyre!("{} must be a non-negative integer, got '{}'", name, value))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key: &str| vars.get(key).cloned()
  }

  #[test]
  fn test_defaults() {
    let config = Config::default();
    let settings = config.client_settings();
    assert_eq!(settings, ClientSettings::default());
    assert_eq!(config.timeout(), Duration::from_secs(30));
    assert_eq!(config.codebeamer.ssl_verify, SslVerify::Enabled(true));
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let yaml = r#"
codebeamer:
  url: https://cb.example.com
  ssl_verify: /etc/ssl/corp.pem
limits:
  max_calls: 10
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.codebeamer.url, "https://cb.example.com");
    assert_eq!(
      config.codebeamer.ssl_verify,
      SslVerify::CaBundle(PathBuf::from("/etc/ssl/corp.pem"))
    );
    assert_eq!(config.limits.max_calls, 10);
    assert_eq!(config.limits.window_secs, 60);
    assert_eq!(config.cache.default_ttl_secs, 300);
  }

  #[test]
  fn test_yaml_ssl_verify_bool() {
    let config: Config = serde_yaml::from_str("codebeamer:\n  ssl_verify: false\n").unwrap();
    assert_eq!(config.codebeamer.ssl_verify, SslVerify::Enabled(false));
  }

  #[test]
  fn test_env_overrides() {
    let mut config = Config::default();
    config
      .apply_env(env(&[
        ("CODEBEAMER_URL", "https://cb.local"),
        ("CODEBEAMER_MAX_CALLS", "5"),
        ("CODEBEAMER_CACHE_TTL", "60"),
        ("CODEBEAMER_SSL_VERIFY", "False"),
        ("CODEBEAMER_TIMEOUT", "10"),
      ]))
      .unwrap();

    assert_eq!(config.codebeamer.url, "https://cb.local");
    assert_eq!(config.limits.max_calls, 5);
    assert_eq!(config.cache.default_ttl_secs, 60);
    assert_eq!(config.codebeamer.ssl_verify, SslVerify::Enabled(false));
    assert_eq!(config.timeout(), Duration::from_secs(10));
  }

  #[test]
  fn test_env_rejects_bad_number() {
    let mut config = Config::default();
    let err = config
      .apply_env(env(&[("CODEBEAMER_MAX_CALLS", "many")]))
      .unwrap_err();
    assert!(err.to_string().contains("CODEBEAMER_MAX_CALLS"));
  }

  #[test]
  fn test_ssl_verify_path() {
    assert_eq!(
      SslVerify::parse("/certs/ca.pem"),
      SslVerify::CaBundle(PathBuf::from("/certs/ca.pem"))
    );
    assert_eq!(SslVerify::parse("TRUE"), SslVerify::Enabled(true));
  }

  #[test]
  fn test_validate() {
    assert!(Config::default().validate().is_ok());

    let mut config = Config::default();
    config.limits.max_calls = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.codebeamer.url = "not a url".to_string();
    assert!(config.validate().is_err());
  }
}
