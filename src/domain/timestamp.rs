//! Timestamp value object for sample times.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Point in time as integer nanoseconds since the Unix epoch.
///
/// This is the resolution the broker emits and the `ts` field clients
/// receive in data batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from nanoseconds since the Unix epoch.
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Returns nanoseconds since the Unix epoch.
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`.
    ///
    /// Returns `None` if `earlier` is after `self`.
    pub fn elapsed_since(&self, earlier: &Timestamp) -> Option<Duration> {
        let delta = self.0.checked_sub(earlier.0)?;
        u64::try_from(delta).ok().map(Duration::from_nanos)
    }
}
