//! In-memory broker implementation for testing.
//!
//! Provides deterministic RPC behavior and call recording for unit and
//! integration tests.
//!
//! # Security Note
//!
//! This adapter is for **testing only** and should not be used in production.
//! It uses `.expect()` on lock operations which will panic if locks are poisoned.
//! Production code should use the Redis stream broker adapter.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use tokio::sync::Semaphore;

use crate::domain::{MetricMetadata, Timestamp};
use crate::ports::{BrokerError, MetricBroker, SinkHandler, StreamSettings, SubscribeResponse};

/// In-memory broker for testing.
///
/// Features:
/// - A configurable catalogue of existing metrics with metadata
/// - Recording of every subscribe/unsubscribe/get_metrics call
/// - Upstream subscription tracking (which internal metrics are active)
/// - Sample and config injection into a [`SinkHandler`]
/// - Holding `subscribe` calls in flight until released
///
/// # Panics
///
/// Methods may panic if internal locks are poisoned. This is acceptable
/// for test code but this adapter should NOT be used in production.
///
/// # Example
///
/// ```ignore
/// let broker = Arc::new(InMemoryBroker::new());
/// broker.add_metric("temp.raw", json!({"unit": "C"}));
///
/// let dispatcher = Dispatcher::new(broker.clone(), StreamSettings::default());
/// // ... subscribe a connection ...
/// broker.emit(&dispatcher, "temp.raw", Timestamp::from_millis(0), 21.5);
///
/// assert_eq!(broker.subscribe_calls().len(), 1);
/// ```
pub struct InMemoryBroker {
    catalogue: RwLock<HashMap<String, MetricMetadata>>,
    active: RwLock<HashSet<String>>,
    subscribe_calls: RwLock<Vec<Vec<String>>>,
    unsubscribe_calls: RwLock<Vec<Vec<String>>>,
    get_metrics_calls: RwLock<Vec<Vec<String>>>,
    fail_subscribe: AtomicBool,
    hold_subscribes: AtomicBool,
    parked_subscribes: AtomicUsize,
    subscribe_gate: Semaphore,
}

impl InMemoryBroker {
    /// Creates a broker that knows no metrics.
    pub fn new() -> Self {
        Self {
            catalogue: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            subscribe_calls: RwLock::new(Vec::new()),
            unsubscribe_calls: RwLock::new(Vec::new()),
            get_metrics_calls: RwLock::new(Vec::new()),
            fail_subscribe: AtomicBool::new(false),
            hold_subscribes: AtomicBool::new(false),
            parked_subscribes: AtomicUsize::new(0),
            subscribe_gate: Semaphore::new(0),
        }
    }

    /// Register a metric as existing, with its metadata.
    pub fn add_metric(&self, metric: impl Into<String>, metadata: MetricMetadata) {
        self.catalogue
            .write()
            .expect("InMemoryBroker: catalogue lock poisoned")
            .insert(metric.into(), metadata);
    }

    /// Make every following `subscribe` call fail until reset.
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// While set, every `subscribe` call waits for [`release_subscribes`]
    /// before it takes effect.
    ///
    /// [`release_subscribes`]: Self::release_subscribes
    pub fn hold_subscribes(&self, hold: bool) {
        self.hold_subscribes.store(hold, Ordering::SeqCst);
    }

    /// Let `count` held `subscribe` calls proceed.
    pub fn release_subscribes(&self, count: usize) {
        self.subscribe_gate.add_permits(count);
    }

    /// Number of `subscribe` calls currently waiting to be released.
    pub fn parked_subscribes(&self) -> usize {
        self.parked_subscribes.load(Ordering::SeqCst)
    }

    /// Deliver a sample to `handler`, as the broker client would.
    pub fn emit(&self, handler: &dyn SinkHandler, metric: &str, timestamp: Timestamp, value: f64) {
        handler.on_data(metric, timestamp, value);
    }

    /// Push a runtime configuration to `handler`.
    pub async fn push_config(&self, handler: &dyn SinkHandler, settings: StreamSettings) {
        handler.on_config(settings).await;
    }

    // === Test Helpers ===

    /// Metric lists passed to each `subscribe` call, in call order.
    pub fn subscribe_calls(&self) -> Vec<Vec<String>> {
        self.subscribe_calls
            .read()
            .expect("InMemoryBroker: calls lock poisoned")
            .clone()
    }

    /// Metric lists passed to each `unsubscribe` call, in call order.
    pub fn unsubscribe_calls(&self) -> Vec<Vec<String>> {
        self.unsubscribe_calls
            .read()
            .expect("InMemoryBroker: calls lock poisoned")
            .clone()
    }

    /// Selectors passed to each `get_metrics` call, in call order.
    pub fn get_metrics_calls(&self) -> Vec<Vec<String>> {
        self.get_metrics_calls
            .read()
            .expect("InMemoryBroker: calls lock poisoned")
            .clone()
    }

    /// Number of `subscribe` calls that included `metric`.
    pub fn subscribe_count(&self, metric: &str) -> usize {
        count_calls(&self.subscribe_calls(), metric)
    }

    /// Number of `unsubscribe` calls that included `metric`.
    pub fn unsubscribe_count(&self, metric: &str) -> usize {
        count_calls(&self.unsubscribe_calls(), metric)
    }

    /// Whether `metric` is currently subscribed upstream.
    pub fn is_active(&self, metric: &str) -> bool {
        self.active
            .read()
            .expect("InMemoryBroker: active lock poisoned")
            .contains(metric)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn count_calls(calls: &[Vec<String>], metric: &str) -> usize {
    calls
        .iter()
        .filter(|call| call.iter().any(|m| m == metric))
        .count()
}

#[async_trait]
impl MetricBroker for InMemoryBroker {
    async fn subscribe(
        &self,
        metrics: &[String],
        metadata: bool,
    ) -> Result<SubscribeResponse, BrokerError> {
        // Give concurrent callers a chance to interleave, like a real RPC.
        tokio::task::yield_now().await;

        if self.hold_subscribes.load(Ordering::SeqCst) {
            self.parked_subscribes.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.subscribe_gate.acquire().await {
                permit.forget();
            }
            self.parked_subscribes.fetch_sub(1, Ordering::SeqCst);
        }

        self.subscribe_calls
            .write()
            .expect("InMemoryBroker: calls lock poisoned")
            .push(metrics.to_vec());

        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Rpc {
                rpc: "subscribe",
                message: "subscription rejected".to_string(),
            });
        }

        let catalogue = self
            .catalogue
            .read()
            .expect("InMemoryBroker: catalogue lock poisoned");
        let mut active = self
            .active
            .write()
            .expect("InMemoryBroker: active lock poisoned");

        let mut response = SubscribeResponse {
            data_queue: Some("in-memory".to_string()),
            metrics: HashMap::new(),
        };
        for metric in metrics {
            active.insert(metric.clone());
            let entry = match catalogue.get(metric) {
                Some(meta) if metadata => meta.clone(),
                Some(_) => serde_json::json!({}),
                None => serde_json::json!({"error": "unknown metric"}),
            };
            response.metrics.insert(metric.clone(), entry);
        }

        Ok(response)
    }

    async fn unsubscribe(&self, metrics: &[String]) -> Result<(), BrokerError> {
        tokio::task::yield_now().await;

        self.unsubscribe_calls
            .write()
            .expect("InMemoryBroker: calls lock poisoned")
            .push(metrics.to_vec());

        let mut active = self
            .active
            .write()
            .expect("InMemoryBroker: active lock poisoned");
        for metric in metrics {
            active.remove(metric);
        }
        Ok(())
    }

    async fn get_metrics(
        &self,
        selector: &[String],
        _metadata: bool,
    ) -> Result<Vec<String>, BrokerError> {
        tokio::task::yield_now().await;

        self.get_metrics_calls
            .write()
            .expect("InMemoryBroker: calls lock poisoned")
            .push(selector.to_vec());

        let catalogue = self
            .catalogue
            .read()
            .expect("InMemoryBroker: catalogue lock poisoned");
        Ok(selector
            .iter()
            .filter(|metric| catalogue.contains_key(metric.as_str()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn subscribe_reports_metadata_and_unknowns() {
        let broker = InMemoryBroker::new();
        broker.add_metric("cpu.load", json!({"unit": "%"}));

        let response = broker
            .subscribe(&names(&["cpu.load", "ghost"]), true)
            .await
            .unwrap();

        assert_eq!(response.metrics["cpu.load"], json!({"unit": "%"}));
        assert!(response.metrics["ghost"].get("error").is_some());
        assert!(broker.is_active("cpu.load"));
        assert!(broker.is_active("ghost"));
    }

    #[tokio::test]
    async fn unsubscribe_deactivates_and_records() {
        let broker = InMemoryBroker::new();
        broker.subscribe(&names(&["x"]), true).await.unwrap();
        broker.unsubscribe(&names(&["x"])).await.unwrap();

        assert!(!broker.is_active("x"));
        assert_eq!(broker.subscribe_count("x"), 1);
        assert_eq!(broker.unsubscribe_count("x"), 1);
    }

    #[tokio::test]
    async fn get_metrics_filters_selector() {
        let broker = InMemoryBroker::new();
        broker.add_metric("temp.raw", json!({}));

        let found = broker
            .get_metrics(&names(&["temp", "temp.raw"]), false)
            .await
            .unwrap();

        assert_eq!(found, names(&["temp.raw"]));
        assert_eq!(broker.get_metrics_calls().len(), 1);
    }

    #[tokio::test]
    async fn failing_subscribe_returns_rpc_error() {
        let broker = InMemoryBroker::new();
        broker.set_fail_subscribe(true);

        let err = broker.subscribe(&names(&["x"]), true).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rpc { rpc: "subscribe", .. }));
        assert!(!broker.is_active("x"));
    }
}
