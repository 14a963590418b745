//! Per-metric subscriber sets with refcounted upstream subscriptions.
//!
//! # Architecture
//!
//! ```text
//! metric: cpu.load        metric: temp
//! ├── connection-a        └── connection-c
//! └── connection-b
//! ```
//!
//! The broker is asked to subscribe a metric when its set goes from empty
//! to non-empty, and to unsubscribe it when the set becomes empty again.
//!
//! # Locking
//!
//! `add` and `remove` run under one async transition section that spans the
//! membership change and the broker RPC, so refcount transitions are
//! linearized. The membership table itself sits behind a short synchronous
//! lock, which lets the dispatch path take snapshots without awaiting.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::{Mutex, MutexGuard};

use crate::domain::{ConnectionId, MetricMetadata};
use crate::ports::{MetricBroker, SampleSubscriber};

use super::error::SinkError;
use super::name_resolver::NameResolver;

/// Subscribers and cached metadata for one primary metric.
#[derive(Default)]
struct MetricEntry {
    subscribers: HashMap<ConnectionId, Weak<dyn SampleSubscriber>>,
    metadata: Option<MetricMetadata>,
}

/// Registry of which connections are interested in which metrics.
pub struct SubscriptionRegistry {
    broker: Arc<dyn MetricBroker>,
    resolver: Arc<NameResolver>,
    transitions: Mutex<()>,
    table: RwLock<HashMap<String, MetricEntry>>,
}

impl SubscriptionRegistry {
    pub fn new(broker: Arc<dyn MetricBroker>, resolver: Arc<NameResolver>) -> Self {
        Self {
            broker,
            resolver,
            transitions: Mutex::new(()),
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Add `subscriber` to every metric in `metrics`.
    ///
    /// Metrics without subscribers so far are subscribed upstream in one
    /// batched call. Returns the metadata for each requested metric, `None`
    /// when the broker has none.
    ///
    /// # Errors
    ///
    /// If the upstream subscribe fails, or the call is cancelled before it
    /// completes, every membership this call created is rolled back.
    pub async fn add(
        &self,
        subscriber: &Arc<dyn SampleSubscriber>,
        metrics: &[String],
    ) -> Result<HashMap<String, Option<MetricMetadata>>, SinkError> {
        let metrics = dedup(metrics);
        let connection = subscriber.connection_id();
        let _section = self.transitions.lock().await;

        self.resolver.resolve(&metrics).await?;

        let mut first_interest = Vec::new();
        let mut pending = PendingJoin {
            registry: self,
            connection,
            joined: Vec::new(),
            armed: true,
        };
        {
            let mut table = self.write();
            for metric in &metrics {
                let entry = table.entry(metric.clone()).or_default();
                if entry.subscribers.is_empty() {
                    first_interest.push(metric.clone());
                }
                let previous = entry
                    .subscribers
                    .insert(connection, Arc::downgrade(subscriber));
                if previous.is_none() {
                    pending.joined.push(metric.clone());
                }
            }
        }

        if !first_interest.is_empty() {
            let internal: Vec<String> = first_interest
                .iter()
                .map(|metric| self.resolver.to_internal(metric))
                .collect();

            tracing::info!(
                connection_id = %connection,
                metrics = ?internal,
                "Subscribing upstream"
            );

            let response = self.broker.subscribe(&internal, true).await?;

            let mut table = self.write();
            for (primary, internal) in first_interest.iter().zip(&internal) {
                let metadata = response.metadata_for(internal).cloned();
                if metadata.is_none() {
                    tracing::warn!(metric = %primary, "No metadata known for metric");
                }
                if let Some(entry) = table.get_mut(primary) {
                    entry.metadata = metadata;
                }
            }
        }

        pending.commit();

        let table = self.read();
        Ok(metrics
            .into_iter()
            .map(|metric| {
                let metadata = table.get(&metric).and_then(|entry| entry.metadata.clone());
                (metric, metadata)
            })
            .collect())
    }

    /// Remove `connection` from every metric in `metrics`.
    ///
    /// Metrics left without subscribers are unsubscribed upstream in one
    /// batched call and their cached metadata is dropped. Returns those
    /// released metrics. Removing a connection that is not subscribed is
    /// logged and otherwise ignored.
    pub async fn remove(
        &self,
        connection: ConnectionId,
        metrics: &[String],
    ) -> Result<Vec<String>, SinkError> {
        let metrics = dedup(metrics);
        let _section = self.transitions.lock().await;

        let mut released = Vec::new();
        {
            let mut table = self.write();
            for metric in metrics {
                let Some(entry) = table.get_mut(&metric) else {
                    tracing::warn!(
                        connection_id = %connection,
                        metric = %metric,
                        "Unsubscribe for metric without subscribers"
                    );
                    continue;
                };
                if entry.subscribers.remove(&connection).is_none() {
                    tracing::warn!(
                        connection_id = %connection,
                        metric = %metric,
                        "Connection was not subscribed to metric"
                    );
                }
                if entry.subscribers.is_empty() {
                    table.remove(&metric);
                    released.push(metric);
                }
            }
        }

        if !released.is_empty() {
            let internal: Vec<String> = released
                .iter()
                .map(|metric| self.resolver.to_internal(metric))
                .collect();

            tracing::info!(
                connection_id = %connection,
                metrics = ?internal,
                "Unsubscribing upstream"
            );
            self.broker.unsubscribe(&internal).await?;
            self.resolver.release(&released);
        }

        Ok(released)
    }

    /// Live subscribers of `metric`, taken as a snapshot.
    ///
    /// Subscribers whose connection has already been dropped are skipped.
    pub fn subscribers(&self, metric: &str) -> Vec<Arc<dyn SampleSubscriber>> {
        self.read()
            .get(metric)
            .map(|entry| {
                entry
                    .subscribers
                    .values()
                    .filter_map(Weak::upgrade)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of connections subscribed to `metric`.
    pub fn subscriber_count(&self, metric: &str) -> usize {
        self.read()
            .get(metric)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Whether any connection is subscribed to `metric`.
    pub fn has_subscribers(&self, metric: &str) -> bool {
        self.subscriber_count(metric) > 0
    }

    /// All metrics with at least one subscriber.
    pub fn active_metrics(&self) -> HashSet<String> {
        self.read().keys().cloned().collect()
    }

    /// Number of distinct connections holding any subscription.
    pub fn connection_count(&self) -> usize {
        self.read()
            .values()
            .flat_map(|entry| entry.subscribers.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Hold off all subscription transitions while the guard lives.
    pub(crate) async fn pause_transitions(&self) -> MutexGuard<'_, ()> {
        self.transitions.lock().await
    }

    fn rollback(&self, connection: ConnectionId, metrics: &[String]) {
        let mut table = self.write();
        for metric in metrics {
            if let Some(entry) = table.get_mut(metric) {
                entry.subscribers.remove(&connection);
                if entry.subscribers.is_empty() {
                    table.remove(metric);
                }
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, MetricEntry>> {
        self.table.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, MetricEntry>> {
        self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Memberships created by an `add` in progress. Rolled back on drop unless
/// committed.
struct PendingJoin<'a> {
    registry: &'a SubscriptionRegistry,
    connection: ConnectionId,
    joined: Vec<String>,
    armed: bool,
}

impl PendingJoin<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.rollback(self.connection, &self.joined);
        }
    }
}

/// Removes duplicates while keeping first-seen order.
fn dedup(metrics: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    metrics
        .iter()
        .filter(|metric| seen.insert(metric.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::broker::InMemoryBroker;
    use crate::domain::Timestamp;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Subscriber that records what it receives.
    struct RecordingSubscriber {
        id: ConnectionId,
        received: StdMutex<Vec<(String, Timestamp, f64)>>,
    }

    impl RecordingSubscriber {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(),
                received: StdMutex::new(Vec::new()),
            })
        }
    }

    impl SampleSubscriber for RecordingSubscriber {
        fn connection_id(&self) -> ConnectionId {
            self.id
        }

        fn enqueue(&self, metric: &str, timestamp: Timestamp, value: f64) {
            self.received
                .lock()
                .unwrap()
                .push((metric.to_string(), timestamp, value));
        }
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn registry_with(broker: &Arc<InMemoryBroker>, suffix: Option<&str>) -> SubscriptionRegistry {
        let resolver = Arc::new(NameResolver::new(
            broker.clone(),
            suffix.map(str::to_string),
        ));
        SubscriptionRegistry::new(broker.clone(), resolver)
    }

    fn as_subscriber(sub: &Arc<RecordingSubscriber>) -> Arc<dyn SampleSubscriber> {
        sub.clone()
    }

    #[tokio::test]
    async fn first_subscriber_triggers_one_batched_subscribe() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = registry_with(&broker, None);
        let sub = as_subscriber(&RecordingSubscriber::new());

        registry.add(&sub, &names(&["a", "b", "c"])).await.unwrap();

        assert_eq!(broker.subscribe_calls(), vec![names(&["a", "b", "c"])]);
        assert_eq!(registry.subscriber_count("a"), 1);
    }

    #[tokio::test]
    async fn second_subscriber_does_not_resubscribe() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = registry_with(&broker, None);
        let a = as_subscriber(&RecordingSubscriber::new());
        let b = as_subscriber(&RecordingSubscriber::new());

        registry.add(&a, &names(&["x"])).await.unwrap();
        registry.add(&b, &names(&["x"])).await.unwrap();

        assert_eq!(broker.subscribe_count("x"), 1);
        assert_eq!(registry.subscriber_count("x"), 2);
    }

    #[tokio::test]
    async fn repeated_add_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = registry_with(&broker, None);
        let sub = as_subscriber(&RecordingSubscriber::new());

        registry.add(&sub, &names(&["x", "x"])).await.unwrap();
        registry.add(&sub, &names(&["x"])).await.unwrap();

        assert_eq!(broker.subscribe_count("x"), 1);
        assert_eq!(registry.subscriber_count("x"), 1);
    }

    #[tokio::test]
    async fn add_returns_metadata_or_none() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.add_metric("known", json!({"unit": "W"}));
        let registry = registry_with(&broker, None);
        let a = as_subscriber(&RecordingSubscriber::new());
        let b = as_subscriber(&RecordingSubscriber::new());

        let metadata = registry.add(&a, &names(&["known", "ghost"])).await.unwrap();
        assert_eq!(metadata["known"], Some(json!({"unit": "W"})));
        assert_eq!(metadata["ghost"], None);

        // Later subscribers get the cached metadata without another RPC.
        let metadata = registry.add(&b, &names(&["known"])).await.unwrap();
        assert_eq!(metadata["known"], Some(json!({"unit": "W"})));
        assert_eq!(broker.subscribe_calls().len(), 1);
    }

    #[tokio::test]
    async fn last_removal_unsubscribes_exactly_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = registry_with(&broker, None);
        let a = as_subscriber(&RecordingSubscriber::new());
        let b = as_subscriber(&RecordingSubscriber::new());

        registry.add(&a, &names(&["x"])).await.unwrap();
        registry.add(&b, &names(&["x"])).await.unwrap();

        let released = registry.remove(a.connection_id(), &names(&["x"])).await.unwrap();
        assert!(released.is_empty());
        assert_eq!(broker.unsubscribe_count("x"), 0);

        let released = registry.remove(b.connection_id(), &names(&["x"])).await.unwrap();
        assert_eq!(released, names(&["x"]));
        assert_eq!(broker.unsubscribe_count("x"), 1);
        assert!(!registry.has_subscribers("x"));
    }

    #[tokio::test]
    async fn double_remove_is_tolerated() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = registry_with(&broker, None);
        let a = as_subscriber(&RecordingSubscriber::new());

        registry.add(&a, &names(&["x"])).await.unwrap();
        registry.remove(a.connection_id(), &names(&["x"])).await.unwrap();
        let released = registry.remove(a.connection_id(), &names(&["x"])).await.unwrap();

        assert!(released.is_empty());
        assert_eq!(broker.unsubscribe_count("x"), 1);
    }

    #[tokio::test]
    async fn failed_subscribe_rolls_back_membership() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = registry_with(&broker, None);
        let a = as_subscriber(&RecordingSubscriber::new());

        broker.set_fail_subscribe(true);
        let result = registry.add(&a, &names(&["x"])).await;
        assert!(matches!(result, Err(SinkError::Broker(_))));
        assert!(!registry.has_subscribers("x"));

        broker.set_fail_subscribe(false);
        registry.add(&a, &names(&["x"])).await.unwrap();
        assert_eq!(broker.subscribe_count("x"), 2);
        assert!(broker.is_active("x"));
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_existing_metrics_untouched() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = registry_with(&broker, None);
        let a = as_subscriber(&RecordingSubscriber::new());
        let b = as_subscriber(&RecordingSubscriber::new());

        registry.add(&b, &names(&["x"])).await.unwrap();

        broker.set_fail_subscribe(true);
        assert!(registry.add(&a, &names(&["x", "y"])).await.is_err());
        assert_eq!(registry.subscriber_count("x"), 1);
        assert!(!registry.has_subscribers("y"));

        // Last real subscriber leaving still releases the metric.
        registry.remove(b.connection_id(), &names(&["x"])).await.unwrap();
        assert_eq!(broker.unsubscribe_count("x"), 1);
    }

    #[tokio::test]
    async fn cancelled_add_rolls_back_membership() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = Arc::new(registry_with(&broker, None));
        let a = as_subscriber(&RecordingSubscriber::new());
        let b = as_subscriber(&RecordingSubscriber::new());

        broker.hold_subscribes(true);
        let task = {
            let registry = registry.clone();
            let a = a.clone();
            tokio::spawn(async move { registry.add(&a, &names(&["x"])).await })
        };
        while broker.parked_subscribes() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.subscriber_count("x"), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!registry.has_subscribers("x"));

        // The next subscriber is the first again and goes upstream.
        broker.hold_subscribes(false);
        registry.add(&b, &names(&["x"])).await.unwrap();
        assert_eq!(broker.subscribe_calls(), vec![names(&["x"])]);
        assert!(broker.is_active("x"));
        assert_eq!(registry.subscriber_count("x"), 1);
    }

    #[tokio::test]
    async fn upstream_calls_use_internal_names() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.add_metric("temp.raw", json!({"unit": "C"}));
        let registry = registry_with(&broker, Some("raw"));
        let a = as_subscriber(&RecordingSubscriber::new());

        let metadata = registry.add(&a, &names(&["temp"])).await.unwrap();
        assert_eq!(metadata["temp"], Some(json!({"unit": "C"})));
        assert_eq!(broker.subscribe_calls(), vec![names(&["temp.raw"])]);

        registry.remove(a.connection_id(), &names(&["temp"])).await.unwrap();
        assert_eq!(broker.unsubscribe_calls(), vec![names(&["temp.raw"])]);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_skipped_in_snapshots() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = registry_with(&broker, None);
        let kept = RecordingSubscriber::new();
        let dropped = RecordingSubscriber::new();

        registry.add(&as_subscriber(&kept), &names(&["x"])).await.unwrap();
        registry.add(&as_subscriber(&dropped), &names(&["x"])).await.unwrap();
        drop(dropped);

        let snapshot = registry.subscribers("x");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].connection_id(), kept.id);
        assert_eq!(registry.connection_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_subscribers_subscribe_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = Arc::new(registry_with(&broker, None));

        let subscribers: Vec<Arc<dyn SampleSubscriber>> = (0..8)
            .map(|_| as_subscriber(&RecordingSubscriber::new()))
            .collect();

        let tasks: Vec<_> = subscribers
            .iter()
            .cloned()
            .map(|sub| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.add(&sub, &names(&["x"])).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(broker.subscribe_count("x"), 1);

        let tasks: Vec<_> = subscribers
            .iter()
            .map(|sub| {
                let registry = registry.clone();
                let id = sub.connection_id();
                tokio::spawn(async move { registry.remove(id, &names(&["x"])).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(broker.unsubscribe_count("x"), 1);
        assert!(!broker.is_active("x"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize, Vec<usize>),
        Remove(usize, Vec<usize>),
    }

    const METRICS: [&str; 3] = ["m0", "m1", "m2"];

    fn op_strategy() -> impl Strategy<Value = Op> {
        let metrics = prop::collection::vec(0..METRICS.len(), 1..4);
        prop_oneof![
            (0..4usize, metrics.clone()).prop_map(|(s, m)| Op::Add(s, m)),
            (0..4usize, metrics).prop_map(|(s, m)| Op::Remove(s, m)),
        ]
    }

    proptest! {
        #[test]
        fn upstream_calls_match_refcount_transitions(
            ops in prop::collection::vec(op_strategy(), 1..40)
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .build()
                .unwrap();

            runtime.block_on(async {
                let broker = Arc::new(InMemoryBroker::new());
                let registry = Arc::new(registry_with(&broker, None));
                let subscribers: Vec<Arc<dyn SampleSubscriber>> = (0..4)
                    .map(|_| as_subscriber(&RecordingSubscriber::new()))
                    .collect();

                let tasks: Vec<_> = ops
                    .iter()
                    .cloned()
                    .map(|op| {
                        let registry = registry.clone();
                        let subscribers = subscribers.clone();
                        tokio::spawn(async move {
                            match op {
                                Op::Add(s, m) => {
                                    let metrics: Vec<String> =
                                        m.iter().map(|i| METRICS[*i].to_string()).collect();
                                    registry.add(&subscribers[s], &metrics).await.map(|_| ())
                                }
                                Op::Remove(s, m) => {
                                    let metrics: Vec<String> =
                                        m.iter().map(|i| METRICS[*i].to_string()).collect();
                                    registry
                                        .remove(subscribers[s].connection_id(), &metrics)
                                        .await
                                        .map(|_| ())
                                }
                            }
                        })
                    })
                    .collect();
                for task in tasks {
                    task.await.unwrap().unwrap();
                }

                for metric in METRICS {
                    let subscribes = broker.subscribe_count(metric);
                    let unsubscribes = broker.unsubscribe_count(metric);
                    let active = registry.has_subscribers(metric);

                    // Every subscribe is matched by an unsubscribe, except for
                    // a metric that still has subscribers.
                    assert_eq!(subscribes, unsubscribes + usize::from(active));
                    assert_eq!(broker.is_active(metric), active);
                }
            });
        }
    }
}
