//! Backhaul broker: publicly reachable half of the relay.
//!
//! Accepts connector sessions on a dedicated WebSocket endpoint and
//! multiplexes external OpenAI-compatible requests back through them,
//! streaming included. Upstream credentials stay on this side and are
//! injected per-request.

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod state;

pub use {
    config::{BrokerConfig, ConnectorAuth},
    error::{Error, Result},
    server::Broker,
};
