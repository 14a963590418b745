//! Stream delivery configuration

use serde::Deserialize;
use std::time::Duration;

use crate::domain::parse_interval;
use crate::ports::StreamSettings;

use super::error::ValidationError;

const MAX_FLUSH_DELAY_MS: u64 = 60_000;

/// Batching and initial broker-side settings
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Delay between the first buffered sample and its flush
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Buffered samples that force an immediate flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Initial metric name suffix, until the broker pushes its own
    pub suffix: Option<String>,

    /// Initial minimum interval between forwarded samples, e.g. `"500ms"`
    #[serde(default = "default_skip_interval")]
    pub skip_interval: String,
}

impl StreamConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    /// Settings in effect until the broker pushes a configuration.
    pub fn settings(&self) -> Result<StreamSettings, ValidationError> {
        let skip_interval = parse_interval(&self.skip_interval)
            .map_err(|e| ValidationError::InvalidSkipInterval(e.to_string()))?;
        Ok(StreamSettings {
            suffix: self.suffix.clone().filter(|suffix| !suffix.is_empty()),
            skip_interval,
        })
    }

    /// Validate stream configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_batch_size == 0 {
            return Err(ValidationError::InvalidBatchSize);
        }
        if self.flush_delay_ms > MAX_FLUSH_DELAY_MS {
            return Err(ValidationError::InvalidFlushDelay);
        }
        self.settings()?;
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay_ms(),
            max_batch_size: default_max_batch_size(),
            suffix: None,
            skip_interval: default_skip_interval(),
        }
    }
}

fn default_flush_delay_ms() -> u64 {
    200
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_skip_interval() -> String {
    "0s".to_string()
}
