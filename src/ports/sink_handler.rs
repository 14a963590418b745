//! SinkHandler port - callbacks the broker client invokes on the sink.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Timestamp;

/// Runtime configuration pushed by the broker through its `config` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSettings {
    /// Suffix tried when resolving primary names; `None` disables suffixing.
    pub suffix: Option<String>,
    /// Minimum gap between two forwarded samples of one metric.
    pub skip_interval: Duration,
}

/// Receiver of everything the broker pushes to the sink.
///
/// `on_data` is called once per decoded sample, in broker emission order.
/// It must not block: implementations only append to in-memory buffers.
#[async_trait]
pub trait SinkHandler: Send + Sync {
    /// A sample for an internal metric name.
    fn on_data(&self, metric: &str, timestamp: Timestamp, value: f64);

    /// New runtime configuration.
    async fn on_config(&self, settings: StreamSettings);
}
