//! Configuration for the site backend.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the backend service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path, optionally prefixed with `sqlite:`. `:memory:` keeps everything in process.
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

/// Identity provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to sign access tokens.
    pub jwt_secret: String,
    /// Access token lifetime (default: 3600).
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: i64,
    /// Refresh token / session lifetime (default: 30 days).
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,
    /// Verification token lifetime for signup confirmation and recovery (default: 1 day).
    #[serde(default = "default_verification_ttl")]
    pub verification_ttl_secs: i64,
    /// New identities must confirm their email before a session is issued.
    #[serde(default = "default_true")]
    pub require_email_confirmation: bool,
    /// Issue sessions to unconfirmed identities anyway. Intended for local testing only.
    #[serde(default)]
    pub allow_unconfirmed_login: bool,
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    /// Sign-in/sign-up attempts allowed per email per minute.
    #[serde(default = "default_attempts_per_minute")]
    pub attempts_per_minute: u32,
    /// Argon2id memory cost in KiB (default: 19456).
    #[serde(default = "default_hash_memory_kib")]
    pub password_hash_memory_kib: u32,
    #[serde(default = "default_hash_iterations")]
    pub password_hash_iterations: u32,
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

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins (comma-separated, `*` for any).
    #[serde(default = "default_cors_origins")]
    pub origins: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: default_cors_origins(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_database_url() -> String {
    "sqlite:./data/site.db".to_string()
}
fn default_access_ttl() -> i64 {
    3600
}
fn default_refresh_ttl() -> i64 {
    30 * 24 * 3600
}
fn default_verification_ttl() -> i64 {
    24 * 3600
}
fn default_true() -> bool {
    true
}
fn default_min_password_length() -> usize {
    6
}
fn default_attempts_per_minute() -> u32 {
    5
}
fn default_hash_memory_kib() -> u32 {
    19 * 1024
}
fn default_hash_iterations() -> u32 {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cors_origins() -> String {
    "*".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (SITE__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("database.url", default_database_url())?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("SITE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl AuthConfig {
    pub fn with_secret(secret: &str) -> Self {
        Self {
            jwt_secret: secret.to_string(),
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
            verification_ttl_secs: default_verification_ttl(),
            require_email_confirmation: default_true(),
            allow_unconfirmed_login: false,
            min_password_length: default_min_password_length(),
            attempts_per_minute: default_attempts_per_minute(),
            password_hash_memory_kib: default_hash_memory_kib(),
            password_hash_iterations: default_hash_iterations(),
        }
    }
}
