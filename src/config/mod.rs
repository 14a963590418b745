//! Application configuration module
//!
//! This module provides type-safe configuration loading from environment variables
//! using the `config` and `dotenvy` crates. Configuration is loaded with the
//! `METRIC_WS_SINK` prefix and nested values use double underscores as separators.
//!
//! # Example
//!
//! ```no_run
//! use metric_ws_sink::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//!
//! println!("Server running on {:?}", config.server.socket_addr());
//! ```

mod error;
mod redis;
mod server;
mod stream;

pub use error::{ConfigError, ValidationError};
pub use redis::RedisConfig;
pub use server::{LogFormat, ServerConfig};
pub use stream::StreamConfig;

use serde::Deserialize;

/// Root application configuration
///
/// Load using [`AppConfig::load()`] which reads from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration (bind address, logging, CORS)
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration (broker streams)
    pub redis: RedisConfig,

    /// Delivery configuration (batching, initial suffix and rate limit)
    #[serde(default)]
    pub stream: StreamConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// This function:
    /// 1. Loads `.env` file if present (for development)
    /// 2. Reads environment variables with `METRIC_WS_SINK` prefix
    /// 3. Uses `__` (double underscore) to separate nested values
    /// 4. Deserializes into typed configuration structs
    ///
    /// # Environment Variable Format
    ///
    /// - `METRIC_WS_SINK__SERVER__PORT=3000` -> `server.port = 3000`
    /// - `METRIC_WS_SINK__REDIS__URL=...` -> `redis.url = ...`
    /// - `METRIC_WS_SINK__STREAM__SKIP_INTERVAL=500ms` -> `stream.skip_interval = "500ms"`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Required environment variables are missing
    /// - Values cannot be parsed into expected types
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("METRIC_WS_SINK")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.redis.validate()?;
        self.stream.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use std::time::Duration;

    // Mutex to ensure tests don't run in parallel (env vars are global)
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn set_minimal_env() {
        env::set_var("METRIC_WS_SINK__REDIS__URL", "redis://localhost:6379");
    }

    fn clear_env() {
        env::remove_var("METRIC_WS_SINK__REDIS__URL");
        env::remove_var("METRIC_WS_SINK__SERVER__PORT");
        env::remove_var("METRIC_WS_SINK__SERVER__LOG_FORMAT");
        env::remove_var("METRIC_WS_SINK__STREAM__SUFFIX");
        env::remove_var("METRIC_WS_SINK__STREAM__SKIP_INTERVAL");
        env::remove_var("METRIC_WS_SINK__STREAM__MAX_BATCH_SIZE");
    }

    #[test]
    fn test_load_from_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = AppConfig::load();
        clear_env();

        assert!(result.is_ok(), "Failed to load config: {:?}", result.err());
        let config = result.unwrap();
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.log_format, LogFormat::Text);
        assert_eq!(config.redis.key_prefix, "metricq:");
        assert_eq!(config.stream.flush_delay(), Duration::from_millis(200));
        assert_eq!(config.stream.max_batch_size, 1000);
    }

    #[test]
    fn test_nested_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        env::set_var("METRIC_WS_SINK__SERVER__PORT", "8081");
        env::set_var("METRIC_WS_SINK__SERVER__LOG_FORMAT", "json");
        env::set_var("METRIC_WS_SINK__STREAM__SUFFIX", "raw");
        env::set_var("METRIC_WS_SINK__STREAM__SKIP_INTERVAL", "500ms");
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.log_format, LogFormat::Json);
        let settings = config.stream.settings().unwrap();
        assert_eq!(settings.suffix.as_deref(), Some("raw"));
        assert_eq!(settings.skip_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_stream_config_fails_validation() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        env::set_var("METRIC_WS_SINK__STREAM__MAX_BATCH_SIZE", "0");
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidBatchSize)
        ));
    }

    #[test]
    fn test_missing_redis_url_fails() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let result = AppConfig::load();

        assert!(result.is_err());
    }
}
