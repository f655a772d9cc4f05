use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{Partition, PartitionNames};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the worker is registered for
  pub origin: Url,
  /// Prefix shared by every partition name
  pub cache_prefix: String,
  /// Version tag, bumped by the build whenever cached content changes
  pub version: String,
  /// Paths stored in the static partition at install time, in order
  pub precache: Vec<String>,
  /// Hosts serving web fonts (cached in the dynamic partition)
  pub font_origins: Vec<String>,
  pub api_prefix: String,
  /// API paths that must never be cached
  pub auth_prefix: String,
  pub app_name: String,
  pub notification: NotificationConfig,
  /// Background sync tag that flushes the offline queue
  pub sync_tag: String,
  pub update_interval_secs: u64,
  /// Partition database (defaults to the platform data directory)
  pub storage_path: Option<PathBuf>,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:3000").expect("static URL is valid"),
      cache_prefix: "tandem".to_string(),
      version: "v1".to_string(),
      precache: vec![
        "/".to_string(),
        "/manifest.json".to_string(),
        "/icon-192.png".to_string(),
        "/icon-512.png".to_string(),
      ],
      font_origins: vec![
        "fonts.googleapis.com".to_string(),
        "fonts.gstatic.com".to_string(),
      ],
      api_prefix: "/api/".to_string(),
      auth_prefix: "/api/auth/".to_string(),
      app_name: "Tandem".to_string(),
      notification: NotificationConfig::default(),
      sync_tag: "sync-data".to_string(),
      update_interval_secs: 60 * 60,
      storage_path: None,
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_tag: String,
  pub default_body: String,
  pub icon: String,
  pub badge: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_tag: "tandem-notification".to_string(),
      default_body: "You have a new update".to_string(),
      icon: "/icon-192.png".to_string(),
      badge: "/icon-192.png".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive, overridden by RUST_LOG
  pub level: String,
  pub json: bool,
  /// Daily-rolling log file
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      json: false,
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tandem-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tandem-sw/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
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
    let local = PathBuf::from("tandem-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tandem-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.version.is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.version.contains('-') {
      return Err(eyre!("version '{}' must not contain '-'", self.version));
    }
    // Garbage collection matches the tag against every name segment
    let reserved = Partition::ALL
      .iter()
      .map(|p| p.as_str())
      .chain(self.cache_prefix.split('-'));
    for segment in reserved {
      if self.version == segment {
        return Err(eyre!(
          "version '{}' collides with a partition name segment",
          self.version
        ));
      }
    }
    if !self.auth_prefix.starts_with(&self.api_prefix) {
      return Err(eyre!(
        "auth_prefix '{}' must live under api_prefix '{}'",
        self.auth_prefix,
        self.api_prefix
      ));
    }
    if let Some(path) = self.precache.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("precache path '{}' must start with '/'", path));
    }
    if self.update_interval_secs == 0 {
      return Err(eyre!("update_interval_secs must be positive"));
    }
    Ok(())
  }

  pub fn partition_names(&self) -> PartitionNames {
    PartitionNames::new(&self.cache_prefix, &self.version)
  }

  /// Resolve a path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Failed to resolve '{}' against {}: {}", path, self.origin, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_from_empty_yaml() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.cache_prefix, "tandem");
    assert_eq!(config.version, "v1");
    assert_eq!(config.precache[0], "/");
    assert_eq!(config.update_interval_secs, 3600);
  }

  #[test]
  fn test_partial_yaml_overrides() {
    let config = Config::from_yaml(
      r#"
origin: https://tandem.app
version: v3
precache: ["/", "/manifest.json"]
notification:
  default_tag: family
"#,
    )
    .unwrap();
    assert_eq!(config.origin.as_str(), "https://tandem.app/");
    assert_eq!(config.version, "v3");
    assert_eq!(config.precache.len(), 2);
    assert_eq!(config.notification.default_tag, "family");
    assert_eq!(config.notification.icon, "/icon-192.png");
  }

  #[test]
  fn test_rejects_dashed_version() {
    assert!(Config::from_yaml("version: v3-beta").is_err());
  }

  #[test]
  fn test_rejects_version_matching_name_segment() {
    assert!(Config::from_yaml("version: api").is_err());
    assert!(Config::from_yaml("version: static").is_err());
    assert!(Config::from_yaml("version: tandem").is_err());
    assert!(Config::from_yaml("cache_prefix: family-budget\nversion: budget").is_err());
    assert!(Config::from_yaml("cache_prefix: family-budget\nversion: v2").is_ok());
  }

  #[test]
  fn test_rejects_auth_prefix_outside_api() {
    assert!(Config::from_yaml("auth_prefix: /auth/").is_err());
  }

  #[test]
  fn test_resolve_path() {
    let config = Config::from_yaml("origin: https://tandem.app").unwrap();
    assert_eq!(
      config.resolve("/manifest.json").unwrap().as_str(),
      "https://tandem.app/manifest.json"
    );
  }

  #[test]
  fn test_missing_explicit_file_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/tandem-sw.yaml"))).is_err());
  }
}
