//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the application to external systems:
//! - `broker` - Metric broker implementations (in-memory, Redis Streams)
//! - `websocket` - Client sessions, buffering, and the upgrade handler
//! - `http` - Router with health check, CORS, and request tracing

pub mod broker;
pub mod http;
pub mod websocket;

pub use broker::{InMemoryBroker, RedisStreamBroker, StreamReader};
pub use self::http::app_router;
pub use websocket::{BufferConfig, Session, WebSocketState};
