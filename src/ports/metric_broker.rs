//! MetricBroker port - RPCs offered by the upstream publish/subscribe broker.
//!
//! The broker client owns the wire protocol, connection, and reconnect
//! handling. The sink only needs the three calls below; they either
//! succeed or return a [`BrokerError`], and the sink never retries them.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::MetricMetadata;

/// Errors that can occur in broker RPCs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Broker connection is not available.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The RPC was rejected or failed on the broker side.
    #[error("broker rpc '{rpc}' failed: {message}")]
    Rpc { rpc: &'static str, message: String },

    /// A broker reply could not be decoded.
    #[error("failed to decode broker reply: {0}")]
    Decode(String),
}

/// Reply to a `subscribe` RPC.
///
/// `metrics` maps each internal metric name to its metadata object, or to
/// an object with an `error` key when the broker knows nothing about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    #[serde(rename = "dataQueue", default, skip_serializing_if = "Option::is_none")]
    pub data_queue: Option<String>,

    #[serde(default)]
    pub metrics: HashMap<String, MetricMetadata>,
}

impl SubscribeResponse {
    /// Metadata for `metric`, or `None` if absent or reported as an error.
    pub fn metadata_for(&self, metric: &str) -> Option<&MetricMetadata> {
        self.metrics
            .get(metric)
            .filter(|meta| meta.get("error").is_none())
    }
}

/// Port for the broker's subscription RPCs.
///
/// Samples for subscribed metrics arrive separately through the
/// [`SinkHandler`](super::SinkHandler) callback.
#[async_trait]
pub trait MetricBroker: Send + Sync {
    /// Start delivering samples for `metrics` (internal names).
    async fn subscribe(
        &self,
        metrics: &[String],
        metadata: bool,
    ) -> Result<SubscribeResponse, BrokerError>;

    /// Stop delivering samples for `metrics` (internal names).
    async fn unsubscribe(&self, metrics: &[String]) -> Result<(), BrokerError>;

    /// Returns the subset of `selector` naming metrics that exist.
    async fn get_metrics(
        &self,
        selector: &[String],
        metadata: bool,
    ) -> Result<Vec<String>, BrokerError>;
}
