//! Backhaul connector: the private half of the relay.
//!
//! Dials an outbound session to the broker, declares the models its local
//! backend serves, and executes relayed requests against that backend —
//! streaming responses chunk by chunk, never buffering a whole body.

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod relay;
pub mod upstream;

pub use {
    client::{ConnectionState, RelayClient},
    config::ConnectorConfig,
    error::{Error, Result},
    upstream::LlmClient,
};
