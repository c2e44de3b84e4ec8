use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::Tier;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Resource name -> tier, overriding the built-in bindings
  #[serde(default)]
  pub tiers: HashMap<String, Tier>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

fn default_base_url() -> String {
  "http://localhost:3002".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_eviction_grace_secs")]
  pub eviction_grace_secs: u64,
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
  /// Keep last-known data between sessions in SQLite
  #[serde(default)]
  pub persist: bool,
  /// Snapshot location (defaults to $XDG_DATA_HOME/gq/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      eviction_grace_secs: default_eviction_grace_secs(),
      sweep_interval_secs: default_sweep_interval_secs(),
      persist: false,
      path: None,
    }
  }
}

impl CacheConfig {
  pub fn eviction_grace(&self) -> Duration {
    Duration::from_secs(self.eviction_grace_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs.max(1))
  }
}

fn default_eviction_grace_secs() -> u64 {
  300
}

fn default_sweep_interval_secs() -> u64 {
  60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
  /// Emit JSON lines
  #[serde(default)]
  pub json: bool,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gq/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("gq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// API token from the environment, if set.
  ///
  /// Checks GQ_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("GQ_API_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_file_content() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.api.base_url, "http://localhost:3002");
    assert_eq!(config.api.timeout(), Duration::from_secs(30));
    assert_eq!(config.cache.eviction_grace(), Duration::from_secs(300));
    assert!(!config.cache.persist);
    assert!(config.tiers.is_empty());
  }

  #[test]
  fn test_parse_full_config() {
    let config = Config::parse(
      r#"
api:
  base_url: https://api.example.org
cache:
  eviction_grace_secs: 30
  persist: true
  path: /tmp/gq.db
tiers:
  video: content
  leaderboard: real-time
log:
  json: true
"#,
    )
    .unwrap();
    assert_eq!(config.api.base_url, "https://api.example.org");
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.cache.eviction_grace_secs, 30);
    assert_eq!(config.cache.sweep_interval_secs, 60);
    assert!(config.cache.persist);
    assert_eq!(config.cache.path, Some(PathBuf::from("/tmp/gq.db")));
    assert_eq!(config.tiers.get("video"), Some(&Tier::Content));
    assert_eq!(config.tiers.get("leaderboard"), Some(&Tier::RealTime));
    assert!(config.log.json);
  }

  #[test]
  fn test_unknown_tier_is_fatal() {
    let err = Config::parse("tiers:\n  video: glacial\n").unwrap_err();
    assert!(err.to_string().contains("glacial"));
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/gq.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gq.yaml");
    std::fs::write(&path, "api:\n  timeout_secs: 5\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.api.timeout(), Duration::from_secs(5));
  }
}
