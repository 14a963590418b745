//! WebSocket message types for live metric streaming.
//!
//! Defines the JSON protocol between the sink and connected clients:
//! - Client → Server: `subscribe` / `unsubscribe` requests
//! - Server → Client: metadata acknowledgements and data batches

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{DataPoint, MetricMetadata};

// ============================================
// Client → Server Messages
// ============================================

/// All requests a client can send, keyed by the `function` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Start streaming the listed metrics (primary names).
    Subscribe { metrics: Vec<String> },

    /// Stop streaming the listed metrics, or all of them if omitted.
    Unsubscribe {
        #[serde(default)]
        metrics: Option<Vec<String>>,
    },

    /// Any other `function` value; ignored.
    #[serde(other)]
    Unknown,
}

// ============================================
// Server → Client Messages
// ============================================

/// All messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Acknowledgement of a subscribe request.
    Metadata(MetadataMessage),

    /// One flushed batch of samples.
    Data(DataMessage),
}

/// `{"metadata": {<metric>: <object-or-null>, ...}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataMessage {
    pub metadata: HashMap<String, Option<MetricMetadata>>,
}

/// `{"data": [{"id": ..., "ts": ..., "value": ...}, ...]}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataMessage {
    pub data: Vec<DataPoint>,
}

impl ServerMessage {
    pub fn metadata(metadata: HashMap<String, Option<MetricMetadata>>) -> Self {
        Self::Metadata(MetadataMessage { metadata })
    }

    pub fn data(data: Vec<DataPoint>) -> Self {
        Self::Data(DataMessage { data })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Errors raised by malformed client messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed client message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parse one inbound text frame.
pub fn parse_request(text: &str) -> Result<ClientRequest, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timestamp;
    use serde_json::json;

    #[test]
    fn subscribe_request_deserializes() {
        let request = parse_request(r#"{"function": "subscribe", "metrics": ["a", "b"]}"#).unwrap();
        assert_eq!(
            request,
            ClientRequest::Subscribe {
                metrics: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn unsubscribe_without_metrics_means_all() {
        let request = parse_request(r#"{"function": "unsubscribe"}"#).unwrap();
        assert_eq!(request, ClientRequest::Unsubscribe { metrics: None });
    }

    #[test]
    fn unknown_function_is_not_an_error() {
        let request = parse_request(r#"{"function": "history", "range": 10}"#).unwrap();
        assert_eq!(request, ClientRequest::Unknown);
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert!(parse_request("not json").is_err());
        assert!(parse_request(r#"{"metrics": ["a"]}"#).is_err());
        assert!(parse_request(r#"{"function": "subscribe"}"#).is_err());
        assert!(parse_request(r#"{"function": "subscribe", "metrics": "a"}"#).is_err());
    }

    #[test]
    fn metadata_message_serializes_with_nulls() {
        let mut metadata = HashMap::new();
        metadata.insert("known".to_string(), Some(json!({"unit": "W"})));
        metadata.insert("ghost".to_string(), None);

        let value: serde_json::Value =
            serde_json::from_str(&ServerMessage::metadata(metadata).to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"metadata": {"known": {"unit": "W"}, "ghost": null}})
        );
    }

    #[test]
    fn data_message_serializes_batch() {
        let message = ServerMessage::data(vec![
            DataPoint::new("x", Timestamp::from_nanos(1_000), 1.0),
            DataPoint::new("y", Timestamp::from_nanos(2_000), 2.5),
        ]);

        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"data": [
                {"id": "x", "ts": 1000, "value": 1.0},
                {"id": "y", "ts": 2000, "value": 2.5}
            ]})
        );
    }
}
