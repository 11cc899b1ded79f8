//! Connector configuration.

use std::{net::SocketAddr, time::Duration};

use {backhaul_protocol::FrameLimits, secrecy::Secret};

pub struct ConnectorConfig {
    /// WebSocket URL of the broker relay endpoint, e.g. `ws://host:8444/ws`.
    pub broker_url: String,
    /// Token presented in AUTH.
    pub token: Secret<String>,
    /// Base URL of the local OpenAI-compatible backend.
    pub llm_url: String,
    /// Local fallback key; a key arriving in a REQUEST frame wins.
    pub llm_api_key: Option<Secret<String>>,
    /// Host header override for backends behind reverse proxies.
    pub llm_host: Option<String>,
    /// Models served by this connector. Empty means discover from the
    /// backend at startup.
    pub models: Vec<String>,
    /// Health endpoint bind address; `None` disables it.
    pub health_addr: Option<SocketAddr>,
    pub llm_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub drain_timeout: Duration,
    pub limits: FrameLimits,
}

impl std::fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("broker_url", &self.broker_url)
            .field("token", &"[REDACTED]")
            .field("llm_url", &self.llm_url)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("models", &self.models)
            .field("health_addr", &self.health_addr)
            .finish()
    }
}

impl ConnectorConfig {
    pub fn new(broker_url: impl Into<String>, token: impl Into<String>, llm_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            token: Secret::new(token.into()),
            llm_url: llm_url.into(),
            llm_api_key: None,
            llm_host: None,
            models: Vec::new(),
            health_addr: None,
            llm_timeout: Duration::from_secs(backhaul_protocol::REQUEST_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(backhaul_protocol::PING_INTERVAL_SECS),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(backhaul_protocol::DRAIN_TIMEOUT_SECS),
            limits: FrameLimits::default(),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }
}
