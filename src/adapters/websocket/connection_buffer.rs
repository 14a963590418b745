//! Per-connection outbound buffering.
//!
//! Samples fanned out by the dispatcher are appended to the connection's
//! buffer. The first sample arms a flush timer; the buffer is sent as one
//! `data` message when the timer fires, or immediately once it holds
//! `max_batch_size` samples.
//!
//! ```text
//! enqueue ──▶ pending ──(delay elapsed | size reached)──▶ outbox ──▶ writer ──▶ WebSocket
//!                                                                      │
//!                                                          send failed ▼
//!                                                      unsubscribe batch metrics
//! ```
//!
//! Appending never blocks: flushing hands the batch to an unbounded
//! channel drained by the connection's writer task, which keeps batches
//! in enqueue order.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::{ConnectionId, DataPoint, Timestamp};
use crate::ports::SampleSubscriber;

use super::messages::ServerMessage;
use super::session::SessionSubscriptions;

/// Flush policy of a connection buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Time from the first buffered sample to the flush.
    pub flush_delay: Duration,
    /// Buffer size that triggers an immediate flush.
    pub max_batch_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(200),
            max_batch_size: 1000,
        }
    }
}

/// Errors raised while sending to a client.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to serialize outbound message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("connection is no longer writable: {0}")]
    Closed(String),
}

#[derive(Default)]
struct BufferState {
    pending: Vec<DataPoint>,
    timer: Option<(u64, JoinHandle<()>)>,
    generation: u64,
    cancelled: bool,
}

/// Buffer of samples waiting to be sent to one connection.
pub struct ConnectionBuffer {
    connection: ConnectionId,
    config: BufferConfig,
    outbox: mpsc::UnboundedSender<ServerMessage>,
    state: Mutex<BufferState>,
    this: Weak<ConnectionBuffer>,
}

impl ConnectionBuffer {
    /// Create a buffer that flushes into `outbox`.
    pub fn new(
        connection: ConnectionId,
        config: BufferConfig,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<Self> {
        let config = BufferConfig {
            max_batch_size: config.max_batch_size.max(1),
            ..config
        };
        Arc::new_cyclic(|this| Self {
            connection,
            config,
            outbox,
            state: Mutex::new(BufferState::default()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> BufferConfig {
        self.config
    }

    /// Append a sample, arming or short-circuiting the flush timer.
    pub fn push(&self, point: DataPoint) {
        let mut state = self.lock();
        if state.cancelled {
            return;
        }

        state.pending.push(point);
        if state.pending.len() >= self.config.max_batch_size {
            self.flush_locked(&mut state);
        } else if state.timer.is_none() {
            self.arm_timer(&mut state);
        }
    }

    /// Send everything buffered right now.
    pub fn flush_now(&self) {
        let mut state = self.lock();
        self.flush_locked(&mut state);
    }

    /// Stop the flush timer and discard buffered samples without sending.
    ///
    /// Later pushes are ignored.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
        state.pending.clear();
    }

    /// Number of samples waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn arm_timer(&self, state: &mut BufferState) {
        state.generation += 1;
        let generation = state.generation;
        let delay = self.config.flush_delay;
        let this = self.this.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(buffer) = this.upgrade() {
                buffer.timer_fired(generation);
            }
        });
        state.timer = Some((generation, timer));
    }

    fn timer_fired(&self, generation: u64) {
        let mut state = self.lock();
        match state.timer {
            Some((armed, _)) if armed == generation => {
                state.timer = None;
                self.flush_locked(&mut state);
            }
            // Superseded by a size-triggered flush.
            _ => {}
        }
    }

    fn flush_locked(&self, state: &mut BufferState) {
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
        if state.pending.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut state.pending);
        tracing::debug!(
            connection_id = %self.connection,
            count = batch.len(),
            "Flushing buffer"
        );
        if self.outbox.send(ServerMessage::data(batch)).is_err() {
            tracing::debug!(
                connection_id = %self.connection,
                "Writer gone, discarding batch"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SampleSubscriber for ConnectionBuffer {
    fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    fn enqueue(&self, metric: &str, timestamp: Timestamp, value: f64) {
        self.push(DataPoint::new(metric, timestamp, value));
    }
}

impl Drop for ConnectionBuffer {
    fn drop(&mut self) {
        if let Some((_, timer)) = self.lock().timer.take() {
            timer.abort();
        }
    }
}

/// Drain `outbox` into the client socket until the session ends.
///
/// A data batch that cannot be sent is discarded, never retried, and the
/// session is unsubscribed from every metric in it.
pub async fn run_writer<S>(
    mut sink: S,
    mut outbox: mpsc::UnboundedReceiver<ServerMessage>,
    subscriptions: Arc<SessionSubscriptions>,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = outbox.recv().await {
        let Err(e) = send_message(&mut sink, &message).await else {
            continue;
        };

        match message {
            ServerMessage::Data(batch) => {
                let metrics: Vec<String> = batch
                    .data
                    .into_iter()
                    .map(|point| point.metric)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                tracing::info!(
                    connection_id = %subscriptions.connection_id(),
                    metrics = ?metrics,
                    error = %e,
                    "Unsubscribing stale websocket"
                );
                if let Err(e) = subscriptions.release(&metrics).await {
                    tracing::error!(
                        connection_id = %subscriptions.connection_id(),
                        "Failed to unsubscribe stale websocket: {}",
                        e
                    );
                }
            }
            ServerMessage::Metadata(_) => {
                tracing::debug!(
                    connection_id = %subscriptions.connection_id(),
                    "Failed to send metadata: {}",
                    e
                );
            }
        }
    }
}

/// Send a JSON message over the WebSocket.
async fn send_message<S>(sink: &mut S, message: &ServerMessage) -> Result<(), DeliveryError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = message.to_json()?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| DeliveryError::Closed(e.to_string()))
}
