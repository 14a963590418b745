//! Client session state machine.
//!
//! ```text
//! OPEN ──(close frame | transport error | protocol violation)──▶ CLOSING ──(cleanup done)──▶ CLOSED
//! ```
//!
//! While open, the session handles `subscribe`/`unsubscribe` requests.
//! Closing cancels the connection buffer and then releases every metric the
//! session holds. A session dropped before it reached CLOSED (for example
//! because the task driving it was aborted) releases its metrics from a
//! spawned task.
//!
//! Every membership change runs on its own task while holding the session's
//! metric set, so cancelling the caller never leaves the set and the
//! registry out of step.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::application::{Dispatcher, SinkError};
use crate::domain::{ConnectionId, MetricMetadata};
use crate::ports::SampleSubscriber;

use super::connection_buffer::{BufferConfig, ConnectionBuffer};
use super::messages::{parse_request, ClientRequest, ProtocolError, ServerMessage};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("subscription failed: {0}")]
    Sink(#[from] SinkError),
}

/// The set of metrics one connection is subscribed to.
///
/// Shared between the session and its writer task, which releases metrics
/// whose delivery failed.
pub struct SessionSubscriptions {
    connection: ConnectionId,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Mutex<HashSet<String>>>,
}

impl SessionSubscriptions {
    pub fn new(connection: ConnectionId, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            connection,
            dispatcher,
            metrics: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Subscribe to the requested metrics this session does not hold yet.
    ///
    /// Returns metadata for those newly subscribed metrics only.
    pub async fn add(
        self: &Arc<Self>,
        subscriber: &Arc<dyn SampleSubscriber>,
        requested: &[String],
    ) -> Result<HashMap<String, Option<MetricMetadata>>, SinkError> {
        let mut held = self.metrics.clone().lock_owned().await;
        let dispatcher = self.dispatcher.clone();
        let subscriber = subscriber.clone();
        let requested = requested.to_vec();

        detached(async move {
            let mut seen = HashSet::new();
            let delta: Vec<String> = requested
                .iter()
                .filter(|metric| !held.contains(*metric) && seen.insert(metric.as_str()))
                .cloned()
                .collect();
            if delta.is_empty() {
                return Ok(HashMap::new());
            }

            let metadata = dispatcher.subscribe(&subscriber, &delta).await?;
            held.extend(delta);
            Ok(metadata)
        })
        .await
    }

    /// Release the given metrics. Metrics this session does not hold are
    /// ignored. Returns the metrics that were released.
    pub async fn release(
        self: &Arc<Self>,
        requested: &[String],
    ) -> Result<Vec<String>, SinkError> {
        let mut held = self.metrics.clone().lock_owned().await;
        let owned: Vec<String> = requested
            .iter()
            .filter(|metric| held.remove(*metric))
            .cloned()
            .collect();
        self.unsubscribe(owned, held).await
    }

    /// Release everything this session holds.
    pub async fn release_all(self: &Arc<Self>) -> Result<Vec<String>, SinkError> {
        let mut held = self.metrics.clone().lock_owned().await;
        let owned: Vec<String> = held.drain().collect();
        self.unsubscribe(owned, held).await
    }

    async fn unsubscribe(
        &self,
        owned: Vec<String>,
        held: OwnedMutexGuard<HashSet<String>>,
    ) -> Result<Vec<String>, SinkError> {
        if owned.is_empty() {
            return Ok(owned);
        }

        let dispatcher = self.dispatcher.clone();
        let connection = self.connection;
        detached(async move {
            dispatcher.unsubscribe(connection, &owned).await?;
            drop(held);
            Ok(owned)
        })
        .await
    }

    /// Currently held metrics, sorted.
    pub async fn metrics(&self) -> Vec<String> {
        let mut metrics: Vec<String> = self.metrics.lock().await.iter().cloned().collect();
        metrics.sort();
        metrics
    }
}

/// One client connection.
pub struct Session {
    state: SessionState,
    buffer: Arc<ConnectionBuffer>,
    subscriptions: Arc<SessionSubscriptions>,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl Session {
    /// Open a session. The returned receiver carries everything that must be
    /// written to the client, in order.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        buffer_config: BufferConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection = ConnectionId::new();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let buffer = ConnectionBuffer::new(connection, buffer_config, outbox.clone());

        tracing::info!(connection_id = %connection, "Session opened");

        let session = Self {
            state: SessionState::Open,
            buffer,
            subscriptions: Arc::new(SessionSubscriptions::new(connection, dispatcher)),
            outbox,
        };
        (session, outbox_rx)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.subscriptions.connection_id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscriptions(&self) -> Arc<SessionSubscriptions> {
        self.subscriptions.clone()
    }

    /// Handle one inbound text frame.
    ///
    /// An error means the session must close.
    pub async fn handle_text(&mut self, text: &str) -> Result<(), SessionError> {
        match parse_request(text)? {
            ClientRequest::Subscribe { metrics } => {
                tracing::debug!(
                    connection_id = %self.connection_id(),
                    metrics = ?metrics,
                    "Subscribe request"
                );
                let subscriber: Arc<dyn SampleSubscriber> = self.buffer.clone();
                let metadata = self.subscriptions.add(&subscriber, &metrics).await?;
                if self.outbox.send(ServerMessage::metadata(metadata)).is_err() {
                    tracing::debug!(
                        connection_id = %self.connection_id(),
                        "Writer gone, metadata not sent"
                    );
                }
            }
            ClientRequest::Unsubscribe { metrics } => {
                let released = match metrics {
                    Some(metrics) => self.subscriptions.release(&metrics).await?,
                    None => self.subscriptions.release_all().await?,
                };
                tracing::debug!(
                    connection_id = %self.connection_id(),
                    metrics = ?released,
                    "Unsubscribe request"
                );
            }
            ClientRequest::Unknown => {
                tracing::debug!(
                    connection_id = %self.connection_id(),
                    "Ignoring unknown function"
                );
            }
        }
        Ok(())
    }

    /// Tear the session down.
    pub async fn close(mut self) -> SessionState {
        self.state = SessionState::Closing;
        self.buffer.cancel();

        let connection = self.connection_id();
        match self.subscriptions.release_all().await {
            Ok(released) => {
                tracing::info!(
                    connection_id = %connection,
                    released = released.len(),
                    "Session closed"
                );
            }
            Err(e) => {
                tracing::error!(
                    connection_id = %connection,
                    "Failed to release subscriptions on close: {}",
                    e
                );
            }
        }

        self.state = SessionState::Closed;
        self.state
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.buffer.cancel();

        let connection = self.connection_id();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                connection_id = %connection,
                "Session dropped outside a runtime, subscriptions not released"
            );
            return;
        };

        let subscriptions = self.subscriptions.clone();
        runtime.spawn(async move {
            match subscriptions.release_all().await {
                Ok(released) => {
                    tracing::info!(
                        connection_id = %connection,
                        released = released.len(),
                        "Session dropped, subscriptions released"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        connection_id = %connection,
                        "Failed to release subscriptions of dropped session: {}",
                        e
                    );
                }
            }
        });
    }
}

/// Run a membership change on its own task and wait for it.
async fn detached<T, F>(change: F) -> Result<T, SinkError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, SinkError>> + Send + 'static,
{
    tokio::spawn(change)
        .await
        .map_err(|e| SinkError::Interrupted(e.to_string()))?
}
