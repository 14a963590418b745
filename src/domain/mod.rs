//! Domain layer containing the value types shared by every other layer.
//!
//! # Module Organization
//!
//! - `ids` - Connection identifiers
//! - `timestamp` - Nanosecond sample timestamps
//! - `interval` - Duration-string parsing for rate-limit intervals
//! - `sample` - Data points and metadata

mod ids;
mod interval;
mod sample;
mod timestamp;

pub use ids::ConnectionId;
pub use interval::{parse_interval, IntervalParseError};
pub use sample::{DataPoint, MetricMetadata};
pub use timestamp::Timestamp;
