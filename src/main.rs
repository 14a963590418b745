//! Metric WebSocket Sink server
//!
//! # Usage
//!
//! ```bash
//! METRIC_WS_SINK__REDIS__URL=redis://localhost:6379 metric-ws-sink
//! ```

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use metric_ws_sink::adapters::{app_router, BufferConfig, RedisStreamBroker, WebSocketState};
use metric_ws_sink::application::Dispatcher;
use metric_ws_sink::config::{AppConfig, LogFormat, ServerConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = AppConfig::load()?;
    config.validate()?;
    init_tracing(&config.server);

    let client = redis::Client::open(config.redis.url.as_str())?;
    let commands = client.get_multiplexed_tokio_connection().await?;
    let reader_conn = client.get_multiplexed_tokio_connection().await?;

    let broker = RedisStreamBroker::new(commands, config.redis.key_prefix.clone());
    let reader = broker.reader(reader_conn, config.redis.block_ms, config.redis.read_count);
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(broker), config.stream.settings()?));

    let buffer_config = BufferConfig {
        flush_delay: config.stream.flush_delay(),
        max_batch_size: config.stream.max_batch_size,
    };
    let app = app_router(
        WebSocketState::new(dispatcher.clone(), buffer_config),
        &config.server.cors_origins_list(),
    );

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Listening");

    let mut reader_task = tokio::spawn(reader.run(dispatcher));
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        result = server => {
            result?;
            tracing::info!("Server stopped");
        }
        result = &mut reader_task => {
            tracing::error!(?result, "Stream reader exited, shutting down");
            std::process::exit(2);
        }
    }

    reader_task.abort();
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_tracing(server: &ServerConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&server.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match server.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
