//! Configuration for the site client and `sitectl`.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the client.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the identity provider and record store live.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Request timeout in seconds (default: 10).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Session backends, consulted in order by `is_authenticated`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Backend names: `legacy`, `provider`.
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,
    /// Legacy session lifetime in hours (default: 24).
    #[serde(default = "default_legacy_ttl_hours")]
    pub legacy_ttl_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            legacy_ttl_hours: default_legacy_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// JSON file backing local storage.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Seconds between reconciliation passes (default: 60).
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_backend_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_backends() -> Vec<String> {
    vec!["legacy".to_string(), "provider".to_string()]
}
fn default_legacy_ttl_hours() -> u64 {
    24
}
fn default_storage_path() -> String {
    "./.sitectl/storage.json".to_string()
}
fn default_reconcile_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "warn".to_string()
}

/// Longest accepted legacy session lifetime (ten years).
pub const MAX_LEGACY_TTL_HOURS: u64 = 24 * 365 * 10;

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (SITECTL__SECTION__KEY format, lists comma-separated)
    /// 2. sitectl.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("backend.url", default_backend_url())?
            .set_default("session.legacy_ttl_hours", default_legacy_ttl_hours() as i64)?
            .add_source(File::with_name("sitectl").required(false))
            .add_source(
                Environment::with_prefix("SITECTL")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("session.backends")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile.interval_secs == 0 {
            return Err(ConfigError::Message(
                "reconcile.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.legacy_ttl_hours > MAX_LEGACY_TTL_HOURS {
            return Err(ConfigError::Message(format!(
                "session.legacy_ttl_hours must be at most {}",
                MAX_LEGACY_TTL_HOURS
            )));
        }
        if self.backend.timeout_secs == 0 {
            return Err(ConfigError::Message(
                "backend.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_session_config() {
        let session = SessionConfig::default();
        assert_eq!(session.backends, vec!["legacy", "provider"]);
        assert_eq!(session.legacy_ttl_hours, 24);
    }

    #[test]
    fn test_deserialize_overrides() {
        let config: Config = ConfigLoader::builder()
            .add_source(config::File::from_str(
                "[backend]\nurl = \"https://site.example\"\n\n[session]\nbackends = [\"provider\"]\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.backend.url, "https://site.example");
        assert_eq!(config.backend.timeout_secs, 10);
        assert_eq!(config.session.backends, vec!["provider"]);
        assert_eq!(config.session.legacy_ttl_hours, 24);
        assert_eq!(config.reconcile.interval_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        let mut config = Config::default();
        config.reconcile.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.legacy_ttl_hours = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.legacy_ttl_hours = MAX_LEGACY_TTL_HOURS;
        assert!(config.validate().is_ok());
    }
}
