//! Configuration error types

use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Errors that can occur during configuration validation
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required configuration missing: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("Invalid Redis URL format")]
    InvalidRedisUrl,

    #[error("Redis read count must be at least 1")]
    InvalidReadCount,

    #[error("Max batch size must be at least 1")]
    InvalidBatchSize,

    #[error("Flush delay exceeds maximum allowed (60s)")]
    InvalidFlushDelay,

    #[error("Invalid skip interval: {0}")]
    InvalidSkipInterval(String),
}
