//! Metric samples and metadata.

use serde::Serialize;

use super::Timestamp;

/// Metric metadata as reported by the broker (an arbitrary JSON object).
pub type MetricMetadata = serde_json::Value;

/// One sample as delivered to a client, already translated to the
/// client-visible (primary) metric name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    /// Primary metric name.
    #[serde(rename = "id")]
    pub metric: String,
    #[serde(rename = "ts")]
    pub timestamp: Timestamp,
    pub value: f64,
}

impl DataPoint {
    pub fn new(metric: impl Into<String>, timestamp: Timestamp, value: f64) -> Self {
        Self {
            metric: metric.into(),
            timestamp,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_point_uses_wire_field_names() {
        let point = DataPoint::new("cpu.load", Timestamp::from_nanos(42), 1.5);
        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json, serde_json::json!({"id": "cpu.load", "ts": 42, "value": 1.5}));
    }
}
