//! Metric WebSocket Sink - live metric streaming for browser clients
//!
//! Subscribes to metrics on an upstream broker on behalf of WebSocket
//! clients, deduplicating upstream subscriptions across clients, rate
//! limiting samples per metric, and delivering them in batches.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
