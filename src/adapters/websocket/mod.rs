//! WebSocket adapters for live metric streaming.
//!
//! # Architecture
//!
//! ```text
//!            Dispatcher (shared)
//!                  │ enqueue
//!      ┌───────────┼────────────┐
//!      ▼           ▼            ▼
//! ConnectionBuffer ConnectionBuffer ...      one per connection
//!      │ flush
//!      ▼
//!   outbox ──▶ writer task ──▶ WebSocket
//!
//! WebSocket ──▶ read loop ──▶ Session ──▶ SessionSubscriptions ──▶ Dispatcher
//! ```
//!
//! # Components
//!
//! - [`messages`] - WebSocket message protocol types
//! - [`connection_buffer`] - Per-connection batching and the writer task
//! - [`session`] - Session lifecycle and per-connection subscriptions
//! - [`handler`] - Axum WebSocket upgrade handler

pub mod connection_buffer;
pub mod handler;
pub mod messages;
pub mod session;

pub use connection_buffer::{run_writer, BufferConfig, ConnectionBuffer, DeliveryError};
pub use handler::{websocket_router, ws_handler, WebSocketState};
pub use messages::{
    parse_request, ClientRequest, DataMessage, MetadataMessage, ProtocolError, ServerMessage,
};
pub use session::{Session, SessionError, SessionState, SessionSubscriptions};
