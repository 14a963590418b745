//! Dispatcher - ties name resolution, subscriptions, and rate limiting
//! together and fans broker samples out to connections.
//!
//! # Sample Flow
//!
//! ```text
//! broker on_data(internal, ts, value)
//!          │
//!          ▼
//!   finite value? ── no ──▶ drop
//!          │
//!          ▼
//!   internal → primary name
//!          │
//!          ▼
//!   any subscribers? ── no ──▶ drop
//!          │
//!          ▼
//!   rate gate admits? ── no ──▶ drop
//!          │
//!          ▼
//!   enqueue on each subscriber snapshot
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ConnectionId, MetricMetadata, Timestamp};
use crate::ports::{MetricBroker, SampleSubscriber, SinkHandler, StreamSettings};

use super::error::SinkError;
use super::name_resolver::NameResolver;
use super::rate_limiter::RateLimiter;
use super::subscription_registry::SubscriptionRegistry;

/// The subscription multiplexer and delivery engine.
///
/// Constructed once at startup and shared (`Arc`) between the broker
/// reader and every client session.
pub struct Dispatcher {
    resolver: Arc<NameResolver>,
    registry: SubscriptionRegistry,
    limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn MetricBroker>, settings: StreamSettings) -> Self {
        let resolver = Arc::new(NameResolver::new(broker.clone(), settings.suffix));
        Self {
            registry: SubscriptionRegistry::new(broker, resolver.clone()),
            resolver,
            limiter: RateLimiter::new(settings.skip_interval),
        }
    }

    /// Subscribe a connection to `metrics` (primary names).
    pub async fn subscribe(
        &self,
        subscriber: &Arc<dyn SampleSubscriber>,
        metrics: &[String],
    ) -> Result<HashMap<String, Option<MetricMetadata>>, SinkError> {
        self.registry.add(subscriber, metrics).await
    }

    /// Unsubscribe a connection from `metrics` (primary names).
    pub async fn unsubscribe(
        &self,
        connection: ConnectionId,
        metrics: &[String],
    ) -> Result<(), SinkError> {
        let released = self.registry.remove(connection, metrics).await?;
        self.limiter.forget(&released);
        Ok(())
    }

    /// Route one broker sample to all interested connections.
    ///
    /// Returns the number of connections the sample was queued for.
    pub fn dispatch(&self, internal: &str, timestamp: Timestamp, value: f64) -> usize {
        if !value.is_finite() {
            return 0;
        }

        let primary = self.resolver.to_primary(internal);
        if !self.registry.has_subscribers(&primary) {
            return 0;
        }
        if !self.limiter.admit(&primary, timestamp) {
            return 0;
        }

        let subscribers = self.registry.subscribers(&primary);
        for subscriber in &subscribers {
            subscriber.enqueue(&primary, timestamp, value);
        }
        subscribers.len()
    }

    /// Apply new runtime settings.
    ///
    /// Mappings of currently subscribed metrics keep their internal name so
    /// that their data keeps flowing and their release reaches the right
    /// upstream subscription. Every other mapping is re-resolved on demand.
    pub async fn apply_settings(&self, settings: StreamSettings) {
        let _paused = self.registry.pause_transitions().await;
        let active = self.registry.active_metrics();

        tracing::info!(
            suffix = ?settings.suffix,
            skip_interval_ms = settings.skip_interval.as_millis() as u64,
            retained = active.len(),
            "Applying stream settings"
        );

        self.resolver.reconfigure(settings.suffix, &active).await;
        self.limiter.set_min_interval(settings.skip_interval);
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Number of connections holding at least one subscription.
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }
}

#[async_trait]
impl SinkHandler for Dispatcher {
    fn on_data(&self, metric: &str, timestamp: Timestamp, value: f64) {
        self.dispatch(metric, timestamp, value);
    }

    async fn on_config(&self, settings: StreamSettings) {
        self.apply_settings(settings).await;
    }
}
