//! SampleSubscriber port - the receiving end of a metric fan-out.

use crate::domain::{ConnectionId, Timestamp};

/// One live client connection as seen by the subscription registry.
///
/// The registry only keeps weak handles to subscribers; the connection
/// owns its own lifecycle and removes its memberships when it closes.
pub trait SampleSubscriber: Send + Sync {
    /// Identifier of the connection behind this subscriber.
    fn connection_id(&self) -> ConnectionId;

    /// Queue a sample for delivery. Must not block.
    fn enqueue(&self, metric: &str, timestamp: Timestamp, value: f64);
}
