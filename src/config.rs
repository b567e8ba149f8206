use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use mealsync_core::sync::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY.as_millis() as u64
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Meal server base URL (e.g., "https://meals.example.com")
    pub server_url: Option<String>,
    /// API key sent as a bearer token
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Try to sync right after write commands (default: false)
    #[serde(default)]
    pub auto_sync: bool,
    /// Delay before the first automatic retry; doubles on each retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Automatic retries before waiting for a refresh or reconnect
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How often `sync watch` probes the server
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            auto_sync: false,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retries: default_max_retries(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SyncConfig {
    /// Returns true if sync is configured (has both server_url and api_key)
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            self.max_retries,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite queue database
    pub database_path: ConfigValue<PathBuf>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync configuration
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let default_db_path = Self::default_data_dir().join("meals.db");

        // Start with defaults
        let mut database_path = ConfigValue::new(default_db_path, ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("MEALS_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("MEALS_SYNC_URL") {
            sync.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("MEALS_SYNC_API_KEY") {
            sync.api_key = Some(key);
        }

        Ok(Self {
            database_path,
            config_file,
            sync,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/meals/
    /// - macOS: ~/Library/Application Support/meals/
    /// - Windows: %APPDATA%/meals/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meals")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/meals/
    /// - macOS: ~/Library/Application Support/meals/
    /// - Windows: %APPDATA%/meals/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meals")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("meals.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert!(config.config_file.is_none());
        assert!(!config.sync.auto_sync);
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.sync.retry_base_delay_ms, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/meals.sqlite").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  server_url: https://meals.example.com").unwrap();
        writeln!(file, "  api_key: secret").unwrap();
        writeln!(file, "  auto_sync: true").unwrap();
        writeln!(file, "  max_retries: 3").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/meals.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.config_file, Some(config_path));
        assert!(config.sync.is_configured());
        assert!(config.sync.auto_sync);
        assert_eq!(config.sync.max_retries, 3);
        // Unset fields keep their defaults
        assert_eq!(config.sync.retry_base_delay_ms, 1000);
        assert_eq!(config.sync.poll_interval_secs, 30);
    }

    #[test]
    fn test_relative_database_path_resolves_against_config_dir() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: data/meals.db").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/meals.db")
        );
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /from/file.db").unwrap();

        std::env::set_var("MEALS_DATABASE_PATH", "/from/env.db");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.database_path.value, PathBuf::from("/from/env.db"));
        assert_eq!(config.database_path.source, ConfigSource::Environment);

        std::env::remove_var("MEALS_DATABASE_PATH");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let sync = SyncConfig {
            retry_base_delay_ms: 250,
            max_retries: 2,
            ..SyncConfig::default()
        };

        let policy = sync.retry_policy();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let sync = SyncConfig {
            api_key: Some("secret".to_string()),
            ..SyncConfig::default()
        };

        let json = serde_json::to_string(&sync).unwrap();
        assert!(!json.contains("secret"));
    }
}
