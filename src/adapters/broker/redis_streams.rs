//! Redis Streams broker for production deployments.
//!
//! Key layout under the configured prefix (default `metricq:`):
//!
//! | Key                    | Type   | Contents                               |
//! |------------------------|--------|----------------------------------------|
//! | `<prefix>data:<name>`  | stream | samples, fields `ts` (ns) and `value`  |
//! | `<prefix>metadata`     | hash   | metric name → metadata JSON            |
//! | `<prefix>config`       | stream | fields `suffix` and `skip_interval`    |
//!
//! Subscribing adds a metric's stream to the set followed by the
//! [`StreamReader`]; the reader blocks in `XREAD` on a dedicated connection,
//! so newly added streams are picked up when the current read returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::domain::{parse_interval, MetricMetadata, Timestamp};
use crate::ports::{BrokerError, MetricBroker, SinkHandler, StreamSettings, SubscribeResponse};

const RETRY_PAUSE: Duration = Duration::from_secs(1);
const STREAM_START: &str = "0-0";

/// Stream and hash names derived from the key prefix.
#[derive(Debug, Clone)]
struct StreamKeys {
    prefix: String,
}

impl StreamKeys {
    fn data(&self, metric: &str) -> String {
        format!("{}data:{}", self.prefix, metric)
    }

    fn metric_of<'a>(&self, stream: &'a str) -> Option<&'a str> {
        stream
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix("data:"))
    }

    fn metadata(&self) -> String {
        format!("{}metadata", self.prefix)
    }

    fn config(&self) -> String {
        format!("{}config", self.prefix)
    }
}

/// Metric name → id of the last entry read from its stream.
type Cursors = Arc<Mutex<HashMap<String, String>>>;

fn lock(cursors: &Cursors) -> MutexGuard<'_, HashMap<String, String>> {
    cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unavailable(e: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

/// Redis Streams implementation of [`MetricBroker`].
#[derive(Clone)]
pub struct RedisStreamBroker {
    conn: MultiplexedConnection,
    keys: StreamKeys,
    cursors: Cursors,
}

impl RedisStreamBroker {
    /// Create a broker issuing commands over `conn`.
    pub fn new(conn: MultiplexedConnection, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            keys: StreamKeys {
                prefix: key_prefix.into(),
            },
            cursors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the reader that feeds subscribed streams into a handler.
    ///
    /// `conn` must not be shared with other commands since the reader keeps
    /// it busy in blocking reads.
    pub fn reader(&self, conn: MultiplexedConnection, block_ms: usize, count: usize) -> StreamReader {
        StreamReader {
            conn,
            keys: self.keys.clone(),
            cursors: self.cursors.clone(),
            config_cursor: None,
            options: StreamReadOptions::default().block(block_ms).count(count),
        }
    }

    /// Id of the newest entry in `stream`, or the stream start if empty.
    async fn latest_id(&self, stream: &str) -> Result<String, BrokerError> {
        let mut conn = self.conn.clone();
        latest_id(&mut conn, stream).await
    }
}

async fn latest_id(conn: &mut MultiplexedConnection, stream: &str) -> Result<String, BrokerError> {
    let reply: StreamRangeReply = conn
        .xrevrange_count(stream, "+", "-", 1)
        .await
        .map_err(unavailable)?;
    Ok(reply
        .ids
        .into_iter()
        .next()
        .map(|entry| entry.id)
        .unwrap_or_else(|| STREAM_START.to_string()))
}

#[async_trait]
impl MetricBroker for RedisStreamBroker {
    async fn subscribe(
        &self,
        metrics: &[String],
        metadata: bool,
    ) -> Result<SubscribeResponse, BrokerError> {
        if metrics.is_empty() {
            return Ok(SubscribeResponse::default());
        }

        // Start each stream after its current tail so only new samples flow.
        let mut starts = Vec::with_capacity(metrics.len());
        for metric in metrics {
            starts.push(self.latest_id(&self.keys.data(metric)).await?);
        }
        {
            let mut cursors = lock(&self.cursors);
            for (metric, start) in metrics.iter().zip(starts) {
                cursors.entry(metric.clone()).or_insert(start);
            }
        }

        let mut response = SubscribeResponse::default();
        if !metadata {
            return Ok(response);
        }

        let mut conn = self.conn.clone();
        let stored: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.metadata())
            .arg(metrics)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Rpc {
                rpc: "subscribe",
                message: e.to_string(),
            })?;

        for (metric, raw) in metrics.iter().zip(stored) {
            let value = match raw {
                Some(raw) => serde_json::from_str::<MetricMetadata>(&raw).unwrap_or_else(|e| {
                    tracing::warn!(metric = %metric, "Undecodable metadata: {}", e);
                    serde_json::json!({ "error": "invalid metadata" })
                }),
                None => serde_json::json!({ "error": "unknown metric" }),
            };
            response.metrics.insert(metric.clone(), value);
        }
        Ok(response)
    }

    async fn unsubscribe(&self, metrics: &[String]) -> Result<(), BrokerError> {
        let mut cursors = lock(&self.cursors);
        for metric in metrics {
            if cursors.remove(metric).is_none() {
                tracing::debug!(metric = %metric, "Unsubscribe for stream not followed");
            }
        }
        Ok(())
    }

    async fn get_metrics(
        &self,
        selector: &[String],
        _metadata: bool,
    ) -> Result<Vec<String>, BrokerError> {
        if selector.is_empty() {
            return Ok(Vec::new());
        }

        let key = self.keys.metadata();
        let mut pipe = redis::pipe();
        for metric in selector {
            pipe.hexists(&key, metric);
        }

        let mut conn = self.conn.clone();
        let exists: Vec<bool> = pipe.query_async(&mut conn).await.map_err(|e| BrokerError::Rpc {
            rpc: "get_metrics",
            message: e.to_string(),
        })?;

        Ok(selector
            .iter()
            .zip(exists)
            .filter(|(_, exists)| *exists)
            .map(|(metric, _)| metric.clone())
            .collect())
    }
}

impl std::fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBroker")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Background loop delivering stream entries to a [`SinkHandler`].
pub struct StreamReader {
    conn: MultiplexedConnection,
    keys: StreamKeys,
    cursors: Cursors,
    config_cursor: Option<String>,
    options: StreamReadOptions,
}

impl StreamReader {
    /// Read forever. Failed reads are logged and retried after a pause.
    pub async fn run(mut self, handler: Arc<dyn SinkHandler>) {
        tracing::info!(prefix = %self.keys.prefix, "Stream reader started");

        loop {
            if let Err(e) = self.poll(handler.as_ref()).await {
                tracing::warn!("Stream read failed, retrying: {}", e);
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }

    /// One blocking read across the config stream and all followed streams.
    async fn poll(&mut self, handler: &dyn SinkHandler) -> Result<(), BrokerError> {
        let config_key = self.keys.config();
        if self.config_cursor.is_none() {
            self.config_cursor = Some(self.apply_latest_config(&config_key, handler).await?);
        }

        let mut streams = vec![config_key.clone()];
        let mut ids = vec![self.config_cursor.clone().unwrap_or_else(|| STREAM_START.to_string())];
        let read_from = lock(&self.cursors).clone();
        for (metric, id) in &read_from {
            streams.push(self.keys.data(metric));
            ids.push(id.clone());
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&streams, &ids, &self.options)
            .await
            .map_err(unavailable)?;
        let Some(reply) = reply else {
            return Ok(());
        };

        for stream in reply.keys {
            if stream.key == config_key {
                for entry in stream.ids {
                    self.config_cursor = Some(entry.id.clone());
                    apply_config(&entry, handler).await;
                }
                continue;
            }

            let Some(metric) = self.keys.metric_of(&stream.key).map(str::to_string) else {
                continue;
            };
            let (Some(read), Some(last)) = (read_from.get(&metric), stream.ids.last()) else {
                continue;
            };
            if !advance_cursor(&mut lock(&self.cursors), &metric, read, &last.id) {
                tracing::debug!(metric = %metric, "Dropping entries read before a resubscribe");
                continue;
            }

            for entry in &stream.ids {
                match decode_sample(entry) {
                    Ok((timestamp, value)) => handler.on_data(&metric, timestamp, value),
                    Err(e) => tracing::warn!(metric = %metric, entry = %entry.id, "{}", e),
                }
            }
        }
        Ok(())
    }

    /// Apply the newest config entry, if any, and return the cursor after it.
    async fn apply_latest_config(
        &mut self,
        config_key: &str,
        handler: &dyn SinkHandler,
    ) -> Result<String, BrokerError> {
        let reply: StreamRangeReply = self
            .conn
            .xrevrange_count(config_key, "+", "-", 1)
            .await
            .map_err(unavailable)?;

        match reply.ids.into_iter().next() {
            Some(entry) => {
                apply_config(&entry, handler).await;
                Ok(entry.id)
            }
            None => Ok(STREAM_START.to_string()),
        }
    }
}

/// Move the cursor of `metric` from `read` to `last`.
///
/// Returns false when the cursor no longer sits at `read`: the metric was
/// unsubscribed, or resubscribed at a newer tail, while the read was in
/// flight. Entries from that read must then be dropped.
fn advance_cursor(
    cursors: &mut HashMap<String, String>,
    metric: &str,
    read: &str,
    last: &str,
) -> bool {
    match cursors.get_mut(metric) {
        Some(cursor) if cursor.as_str() == read => {
            *cursor = last.to_string();
            true
        }
        _ => false,
    }
}

fn decode_sample(entry: &StreamId) -> Result<(Timestamp, f64), BrokerError> {
    let ts: i64 = entry
        .get("ts")
        .ok_or_else(|| BrokerError::Decode("sample without integer 'ts'".to_string()))?;
    let value: f64 = entry
        .get("value")
        .ok_or_else(|| BrokerError::Decode("sample without numeric 'value'".to_string()))?;
    Ok((Timestamp::from_nanos(ts), value))
}

fn decode_settings(entry: &StreamId) -> Result<StreamSettings, BrokerError> {
    let suffix: Option<String> = entry
        .get::<String>("suffix")
        .filter(|suffix| !suffix.is_empty());
    let skip_interval = match entry.get::<String>("skip_interval") {
        Some(raw) => parse_interval(&raw).map_err(|e| BrokerError::Decode(e.to_string()))?,
        None => Duration::ZERO,
    };
    Ok(StreamSettings {
        suffix,
        skip_interval,
    })
}

async fn apply_config(entry: &StreamId, handler: &dyn SinkHandler) {
    match decode_settings(entry) {
        Ok(settings) => handler.on_config(settings).await,
        Err(e) => tracing::warn!(entry = %entry.id, "Ignoring config entry: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::Data(v.as_bytes().to_vec())))
                .collect(),
        }
    }

    #[test]
    fn keys_follow_prefix() {
        let keys = StreamKeys {
            prefix: "metricq:".to_string(),
        };
        assert_eq!(keys.data("cpu.load"), "metricq:data:cpu.load");
        assert_eq!(keys.metadata(), "metricq:metadata");
        assert_eq!(keys.config(), "metricq:config");
        assert_eq!(keys.metric_of("metricq:data:cpu.load"), Some("cpu.load"));
        assert_eq!(keys.metric_of("metricq:config"), None);
    }

    #[test]
    fn decodes_sample_fields() {
        let (ts, value) = decode_sample(&entry(&[("ts", "1500"), ("value", "2.5")])).unwrap();
        assert_eq!(ts, Timestamp::from_nanos(1500));
        assert_eq!(value, 2.5);
    }

    #[test]
    fn rejects_incomplete_samples() {
        assert!(decode_sample(&entry(&[("ts", "1500")])).is_err());
        assert!(decode_sample(&entry(&[("ts", "x"), ("value", "1")])).is_err());
    }

    #[test]
    fn cursor_advances_only_from_the_id_that_was_read() {
        let mut cursors = HashMap::from([("cpu".to_string(), "5-0".to_string())]);

        assert!(advance_cursor(&mut cursors, "cpu", "5-0", "9-0"));
        assert_eq!(cursors["cpu"], "9-0");

        // Resubscribed at a newer tail while an older read was in flight.
        cursors.insert("cpu".to_string(), "20-0".to_string());
        assert!(!advance_cursor(&mut cursors, "cpu", "9-0", "12-0"));
        assert_eq!(cursors["cpu"], "20-0");

        // Unsubscribed meanwhile.
        assert!(!advance_cursor(&mut cursors, "mem", "1-0", "2-0"));
        assert!(!cursors.contains_key("mem"));
    }

    #[test]
    fn decodes_settings() {
        let settings =
            decode_settings(&entry(&[("suffix", "raw"), ("skip_interval", "500ms")])).unwrap();
        assert_eq!(settings.suffix.as_deref(), Some("raw"));
        assert_eq!(settings.skip_interval, Duration::from_millis(500));

        let settings = decode_settings(&entry(&[("suffix", "")])).unwrap();
        assert_eq!(settings.suffix, None);
        assert_eq!(settings.skip_interval, Duration::ZERO);

        assert!(decode_settings(&entry(&[("skip_interval", "soon")])).is_err());
    }

    // Note: Redis integration tests require a running Redis instance
    // and are typically run separately from unit tests.
    //
    // #[tokio::test]
    // #[ignore] // Run with: cargo test -- --ignored
    // async fn test_redis_stream_broker() {
    //     let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    //     let conn = client.get_multiplexed_tokio_connection().await.unwrap();
    //     let broker = RedisStreamBroker::new(conn, "test:");
    //     // ... test code
    // }
}
