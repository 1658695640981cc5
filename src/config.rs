use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

/// Largest number of seconds a chrono duration can hold
pub const MAX_DURATION_SECS: u64 = (i64::MAX / 1000) as u64;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the application whose requests are intercepted
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Leading component of every namespace name
  pub prefix: String,
  /// Bumping this orphans every namespace of the previous version
  pub version: u32,
  /// Database file (default: $XDG_DATA_HOME/offsync/offsync.db)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "offsync".to_string(),
      version: 1,
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Content-hashed build output, served cache-first forever
  pub asset_prefix: String,
  pub image_prefix: String,
  /// Image file extensions (case-insensitive, without the dot)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub image_extensions: BTreeSet<String>,
  pub image_max_entries: usize,
  /// Exact GET paths served with TTL stale-while-revalidate
  pub reference_endpoints: Vec<String>,
  pub reference_ttl_secs: u64,
  pub api_prefix: String,
  /// Mutating endpoints diverted to the offline queue. A trailing `*`
  /// turns the entry into a prefix match.
  pub mutation_endpoints: Vec<String>,
  pub offline_fallback: String,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      asset_prefix: "/_next/static/".to_string(),
      image_prefix: "/images/".to_string(),
      image_extensions: ["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"]
        .into_iter()
        .map(String::from)
        .collect(),
      image_max_entries: 60,
      reference_endpoints: Vec::new(),
      reference_ttl_secs: 300,
      api_prefix: "/api/".to_string(),
      mutation_endpoints: Vec::new(),
      offline_fallback: "/offline".to_string(),
    }
  }
}

impl RoutesConfig {
  pub fn reference_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.reference_ttl_secs.min(MAX_DURATION_SECS) as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Request headers persisted alongside a queued body (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub preserve_headers: BTreeSet<String>,
  pub max_attempts: u32,
  pub base_delay_secs: u64,
  pub max_delay_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      preserve_headers: ["content-type", "accept", "authorization"]
        .into_iter()
        .map(String::from)
        .collect(),
      max_attempts: 5,
      base_delay_secs: 30,
      max_delay_secs: 3600,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
  /// Log file directory (default: $XDG_DATA_HOME/offsync/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    if config.routes.image_max_entries == 0 {
      return Err(eyre!("routes.image_max_entries must be at least 1"));
    }
    for (name, secs) in [
      ("routes.reference_ttl_secs", config.routes.reference_ttl_secs),
      ("queue.base_delay_secs", config.queue.base_delay_secs),
      ("queue.max_delay_secs", config.queue.max_delay_secs),
    ] {
      if secs > MAX_DURATION_SECS {
        return Err(eyre!("{} must be at most {}", name, MAX_DURATION_SECS));
      }
    }
    Ok(config)
  }

  /// Directory holding the database and logs unless overridden.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("offsync.db")),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log.directory {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("logs")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("origin: https://app.example.com\n").unwrap();

    assert_eq!(config.origin.as_str(), "https://app.example.com/");
    assert_eq!(config.cache.prefix, "offsync");
    assert_eq!(config.routes.image_max_entries, 60);
    assert_eq!(config.routes.reference_ttl(), chrono::Duration::seconds(300));
    assert!(config.queue.preserve_headers.contains("content-type"));
    assert_eq!(config.queue.max_attempts, 5);
  }

  #[test]
  fn test_sections_override_defaults() {
    let yaml = r#"
origin: https://app.example.com
cache:
  version: 3
routes:
  image_extensions: [PNG, Webp]
  reference_endpoints: ["/api/subjects"]
  mutation_endpoints: ["/api/study-plan", "/api/progress/*"]
queue:
  preserve_headers: [Content-Type, X-Csrf-Token]
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.cache.version, 3);
    assert_eq!(config.cache.prefix, "offsync");
    assert!(config.routes.image_extensions.contains("png"));
    assert!(config.routes.image_extensions.contains("webp"));
    assert_eq!(config.routes.mutation_endpoints.len(), 2);
    assert!(config.queue.preserve_headers.contains("x-csrf-token"));
  }

  #[test]
  fn test_out_of_range_durations_are_rejected() {
    for field in [
      "routes:\n  reference_ttl_secs: 10000000000000000\n",
      "queue:\n  base_delay_secs: 18446744073709551615\n",
      "queue:\n  max_delay_secs: 9223372036854776\n",
    ] {
      let yaml = format!("origin: https://app.example.com\n{}", field);
      assert!(Config::from_yaml(&yaml).is_err(), "accepted {}", field);
    }

    let yaml = format!(
      "origin: https://app.example.com\nroutes:\n  reference_ttl_secs: {}\n",
      MAX_DURATION_SECS
    );
    let config = Config::from_yaml(&yaml).unwrap();
    assert_eq!(
      config.routes.reference_ttl(),
      chrono::Duration::seconds(MAX_DURATION_SECS as i64)
    );
  }

  #[test]
  fn test_zero_image_bound_is_rejected() {
    let yaml = "origin: https://app.example.com\nroutes:\n  image_max_entries: 0\n";
    assert!(Config::from_yaml(yaml).is_err());
  }
}
