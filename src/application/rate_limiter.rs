//! Per-metric delivery gate.
//!
//! A sample is forwarded only if at least `min_interval` has passed since
//! the last forwarded sample of the same metric, measured in sample time.
//! The gate is per metric, not per connection: every subscriber sees the
//! same decimated stream.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::domain::Timestamp;

#[derive(Debug, Default)]
struct GateState {
    min_interval: Duration,
    last_forwarded: HashMap<String, Timestamp>,
}

/// Tracks the last forwarded timestamp of each metric.
#[derive(Debug, Default)]
pub struct RateLimiter {
    state: Mutex<GateState>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            state: Mutex::new(GateState {
                min_interval,
                last_forwarded: HashMap::new(),
            }),
        }
    }

    /// Decide whether a sample of `metric` at `timestamp` is forwarded.
    ///
    /// Records `timestamp` as the last forwarded time when it is.
    /// Samples older than the last forwarded one are always dropped.
    pub fn admit(&self, metric: &str, timestamp: Timestamp) -> bool {
        let mut state = self.lock();
        let min_interval = state.min_interval;

        if let Some(last) = state.last_forwarded.get(metric) {
            match timestamp.elapsed_since(last) {
                Some(gap) if gap >= min_interval => {}
                _ => return false,
            }
        }

        state.last_forwarded.insert(metric.to_string(), timestamp);
        true
    }

    pub fn min_interval(&self) -> Duration {
        self.lock().min_interval
    }

    /// Change the minimum interval; existing timestamps are kept.
    pub fn set_min_interval(&self, min_interval: Duration) {
        self.lock().min_interval = min_interval;
    }

    /// Forget the last forwarded timestamps of `metrics`.
    pub fn forget(&self, metrics: &[String]) {
        let mut state = self.lock();
        for metric in metrics {
            state.last_forwarded.remove(metric);
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
