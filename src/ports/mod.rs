//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the sink and the broker client. Adapters implement these ports.
//!
//! - `MetricBroker` - subscribe/unsubscribe/existence RPCs issued by the sink
//! - `SinkHandler` - sample and configuration callbacks issued by the broker
//! - `SampleSubscriber` - per-connection receiver of fanned-out samples

mod metric_broker;
mod sample_subscriber;
mod sink_handler;

pub use metric_broker::{BrokerError, MetricBroker, SubscribeResponse};
pub use sample_subscriber::SampleSubscriber;
pub use sink_handler::{SinkHandler, StreamSettings};
