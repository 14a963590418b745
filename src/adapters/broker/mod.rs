//! Broker adapters - implementations of the `MetricBroker` port.
//!
//! - [`InMemoryBroker`] - deterministic broker for tests
//! - [`RedisStreamBroker`] - Redis Streams transport for production

mod in_memory;
mod redis_streams;

pub use in_memory::InMemoryBroker;
pub use redis_streams::{RedisStreamBroker, StreamReader};
