//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::buffer::{self, BufferSettings};
use crate::cleanup::CleanupSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// "redis" (shared across instances) or "memory" (single instance only)
    #[serde(default = "default_buffer_driver")]
    pub driver: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_buffer_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            driver: default_buffer_driver(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            flush_interval_secs: default_flush_interval_secs(),
            max_batch_size: default_max_batch_size(),
            stale_threshold_secs: default_stale_threshold_secs(),
            cleanup_interval_secs: default_buffer_cleanup_interval_secs(),
        }
    }
}

impl BufferConfig {
    pub fn settings(&self) -> BufferSettings {
        BufferSettings {
            key_prefix: self.key_prefix.clone(),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            max_batch_size: self.max_batch_size,
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }
}

fn default_buffer_driver() -> String {
    "redis".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_key_prefix() -> String {
    buffer::DEFAULT_KEY_PREFIX.to_string()
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_max_batch_size() -> usize {
    buffer::MAX_BATCH_SIZE
}

fn default_stale_threshold_secs() -> u64 {
    buffer::STALE_DATA_THRESHOLD.as_secs()
}

fn default_buffer_cleanup_interval_secs() -> u64 {
    buffer::CLEANUP_INTERVAL.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// "sqlite" or "postgres"
    #[serde(default = "default_database_driver")]
    pub driver: String,
    /// File path for sqlite, connection URL for postgres
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: default_database_driver(),
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_driver() -> String {
    "sqlite".to_string()
}

fn default_database_url() -> String {
    "./data/inventory.db".to_string()
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
    /// Durable records not synced for this long are deleted
    #[serde(default = "default_inactive_threshold_secs")]
    pub inactive_threshold_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            inactive_threshold_secs: default_inactive_threshold_secs(),
            interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl CleanupConfig {
    pub fn settings(&self) -> CleanupSettings {
        CleanupSettings {
            inactive_threshold: Duration::from_secs(self.inactive_threshold_secs),
            interval: Duration::from_secs(self.interval_secs),
            ..CleanupSettings::default()
        }
    }
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_inactive_threshold_secs() -> u64 {
    60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    10 * 60
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

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("INVENTORY_RELAY").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.buffer.driver != "redis" && self.buffer.driver != "memory" {
            anyhow::bail!("Invalid buffer driver '{}'. Must be 'redis' or 'memory'", self.buffer.driver);
        }
        if self.buffer.driver == "redis" && self.buffer.redis_url.is_empty() {
            anyhow::bail!("Redis URL cannot be empty");
        }
        if self.buffer.key_prefix.is_empty() {
            anyhow::bail!("Buffer key prefix cannot be empty");
        }
        if self.buffer.max_batch_size == 0 {
            anyhow::bail!("Buffer max_batch_size must be at least 1");
        }
        if self.buffer.flush_interval_secs == 0 || self.buffer.cleanup_interval_secs == 0 {
            anyhow::bail!("Buffer intervals must be at least one second");
        }
        if self.buffer.stale_threshold_secs == 0 {
            anyhow::bail!("Buffer stale_threshold_secs must be at least one second");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.driver != "sqlite" && self.database.driver != "postgres" {
            anyhow::bail!("Invalid database driver '{}'. Must be 'sqlite' or 'postgres'", self.database.driver);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.buffer.max_batch_size, 20);
        assert_eq!(config.server_address(), "0.0.0.0:8080");
    }

    #[test]
    fn rejects_unknown_drivers() {
        let mut config = Config::default();
        config.database.driver = "mongodb".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.buffer.driver = "memcached".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size_and_port() {
        let mut config = Config::default();
        config.buffer.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_stale_threshold() {
        let mut config = Config::default();
        config.buffer.stale_threshold_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn memory_buffer_does_not_need_redis() {
        let mut config = Config::default();
        config.buffer.driver = "memory".to_string();
        config.buffer.redis_url.clear();
        config.validate().unwrap();
    }

    #[test]
    fn deserializes_partial_sections() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[buffer]\nflush_interval_secs = 5\n[database]\ndriver = \"postgres\"\nurl = \"postgres://localhost/inv\"",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();

        assert_eq!(config.buffer.settings().flush_interval, Duration::from_secs(5));
        assert_eq!(config.buffer.max_batch_size, 20);
        assert_eq!(config.database.driver, "postgres");
        assert_eq!(config.server.port, 8080);
        config.validate().unwrap();
    }
}
