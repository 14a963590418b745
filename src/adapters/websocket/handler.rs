//! WebSocket upgrade handler for metric streaming connections.
//!
//! Handles the HTTP → WebSocket upgrade and manages the connection lifecycle:
//! 1. Upgrade to WebSocket and open a session
//! 2. Spawn the writer draining the session outbox into the socket
//! 3. Feed inbound text frames to the session until close or violation
//! 4. Close the session, releasing its subscriptions

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::StreamExt;

use crate::application::Dispatcher;

use super::connection_buffer::{run_writer, BufferConfig};
use super::session::Session;

/// State required for WebSocket handling.
#[derive(Clone)]
pub struct WebSocketState {
    /// Shared subscription dispatcher.
    pub dispatcher: Arc<Dispatcher>,
    /// Flush policy applied to each connection.
    pub buffer_config: BufferConfig,
}

impl WebSocketState {
    pub fn new(dispatcher: Arc<Dispatcher>, buffer_config: BufferConfig) -> Self {
        Self {
            dispatcher,
            buffer_config,
        }
    }
}

/// Handle WebSocket upgrade requests.
///
/// Route: `GET /`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebSocketState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: WebSocketState) {
    let (sender, mut receiver) = socket.split();
    let (mut session, outbox) = Session::new(state.dispatcher.clone(), state.buffer_config);
    let connection_id = session.connection_id();

    let writer = tokio::spawn(run_writer(sender, outbox, session.subscriptions()));

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Err(e) = session.handle_text(&text).await {
                    tracing::error!(
                        connection_id = %connection_id,
                        "Closing session: {}",
                        e
                    );
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    "Received unsupported binary message"
                );
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Answered by axum.
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    "Client sent close frame"
                );
                break;
            }
            Err(e) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    "Receive error: {}",
                    e
                );
                break;
            }
        }
    }

    session.close().await;
    writer.abort();
}

/// Create axum router for the WebSocket endpoint.
///
/// # Example
///
/// ```ignore
/// let app = Router::new()
///     .merge(websocket_router())
///     .with_state(ws_state);
/// ```
pub fn websocket_router() -> axum::Router<WebSocketState> {
    use axum::routing::get;

    axum::Router::new().route("/", get(ws_handler))
}
