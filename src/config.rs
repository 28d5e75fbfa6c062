use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{
  CacheConfig, DEFAULT_PAGE_SIZE, DEFAULT_PREFETCH_DELAY, DEFAULT_SEARCH_DEBOUNCE,
  DEFAULT_SEARCH_MIN_LENGTH,
};
use crate::operation::{TrackerConfig, DEFAULT_TICK_INTERVAL, DEFAULT_TIMEOUT};
use crate::retry::RetryOptions;

/// Environment variable holding the API bearer token.
pub const TOKEN_ENV: &str = "RESQ_API_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  /// Overrides applied on top of the per-error retry policy
  pub retry: RetryOptions,
  pub operation: OperationConfig,
  pub cache: CacheSettings,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
  /// Advisory deadline per operation
  pub timeout_ms: u64,
  pub tick_interval_ms: u64,
}

impl Default for OperationConfig {
  fn default() -> Self {
    Self {
      timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
      tick_interval_ms: DEFAULT_TICK_INTERVAL.as_millis() as u64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub page_size: usize,
  pub prefetch_enabled: bool,
  pub prefetch_delay_ms: u64,
  pub search_min_length: usize,
  pub search_debounce_ms: u64,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      page_size: DEFAULT_PAGE_SIZE,
      prefetch_enabled: true,
      prefetch_delay_ms: DEFAULT_PREFETCH_DELAY.as_millis() as u64,
      search_min_length: DEFAULT_SEARCH_MIN_LENGTH,
      search_debounce_ms: DEFAULT_SEARCH_DEBOUNCE.as_millis() as u64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when RUST_LOG is unset (e.g. "info", "resq=debug")
  pub level: String,
  /// Log to this file instead of stderr
  pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      log_file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./resq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/resq/config.yaml
  ///
  /// Without any file the defaults are used.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("resq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("resq").join("config.yaml");
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

    Ok(config)
  }

  /// Bearer token for the API, if one is set in the environment.
  pub fn api_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
  }

  pub fn tracker_config(&self) -> TrackerConfig {
    TrackerConfig::default()
      .with_timeout(Duration::from_millis(self.operation.timeout_ms))
      .with_tick_interval(Duration::from_millis(self.operation.tick_interval_ms))
  }

  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig::default()
      .with_page_size(self.cache.page_size)
      .with_prefetch(self.cache.prefetch_enabled)
      .with_prefetch_delay(Duration::from_millis(self.cache.prefetch_delay_ms))
      .with_search_min_length(self.cache.search_min_length)
      .with_search_debounce(Duration::from_millis(self.cache.search_debounce_ms))
      .with_retry(self.retry)
      .with_tracker(self.tracker_config())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_partial_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "api:\n  base_url: https://ops.example.com\nretry:\n  max_retries: 5\ncache:\n  page_size: 50\nlogging:\n  level: debug"
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.api.base_url, "https://ops.example.com");
    assert_eq!(config.retry.max_retries, Some(5));
    assert_eq!(config.retry.base_delay_ms, None);
    assert_eq!(config.cache.page_size, 50);
    assert!(config.cache.prefetch_enabled);
    assert_eq!(config.cache.search_debounce_ms, 300);
    assert_eq!(config.operation.timeout_ms, 30_000);
    assert_eq!(config.logging.level, "debug");

    let cache = config.cache_config();
    assert_eq!(cache.page_size, 50);
    assert_eq!(cache.retry.max_retries, Some(5));
    assert_eq!(cache.tracker.timeout, Duration::from_secs(30));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }

  #[test]
  fn test_invalid_yaml_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cache: [not, a, map]").unwrap();
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.cache_config(), CacheConfig::default());
    assert_eq!(config.tracker_config(), TrackerConfig::default());
  }
}
