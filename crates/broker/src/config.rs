//! Broker configuration: bind addresses, connector token table, user keys
//! and timeouts. Loaded from a TOML file with env-var fallback for the path.

use std::{collections::HashMap, net::SocketAddr, path::Path, time::Duration};

use {
    backhaul_protocol::FrameLimits,
    secrecy::Secret,
    serde::Deserialize,
};

use crate::error::{Error, Result};

/// One row of the connector table: an accepted token and the upstream
/// credential the broker injects into requests routed to that connector.
/// The credential never leaves the broker except inside REQUEST frames.
pub struct ConnectorAuth {
    pub token: String,
    pub llm_api_key: Option<Secret<String>>,
}

impl std::fmt::Debug for ConnectorAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorAuth")
            .field("token", &"[REDACTED]")
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

pub struct BrokerConfig {
    /// External OpenAI-compatible API.
    pub api_addr: SocketAddr,
    /// Connector relay endpoint (`/ws`).
    pub relay_addr: SocketAddr,
    /// Health/readiness endpoint.
    pub health_addr: SocketAddr,
    /// Accepted user keys for the external API. Empty disables API auth.
    pub user_keys: Vec<String>,
    /// Accepted connector tokens, keyed by token.
    connectors: HashMap<String, Option<Secret<String>>>,
    pub auth_timeout: Duration,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    pub drain_timeout: Duration,
    pub limits: FrameLimits,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("api_addr", &self.api_addr)
            .field("relay_addr", &self.relay_addr)
            .field("health_addr", &self.health_addr)
            .field("user_keys", &format!("{} configured", self.user_keys.len()))
            .field("connectors", &format!("{} configured", self.connectors.len()))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_addr: "0.0.0.0:8443".parse().expect("static addr"),
            relay_addr: "0.0.0.0:8444".parse().expect("static addr"),
            health_addr: "0.0.0.0:8080".parse().expect("static addr"),
            user_keys: Vec::new(),
            connectors: HashMap::new(),
            auth_timeout: Duration::from_secs(backhaul_protocol::AUTH_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(backhaul_protocol::REQUEST_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(backhaul_protocol::PING_INTERVAL_SECS),
            drain_timeout: Duration::from_secs(backhaul_protocol::DRAIN_TIMEOUT_SECS),
            limits: FrameLimits::default(),
        }
    }
}

impl BrokerConfig {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("read {}: {e}", path.as_ref().display())))?;
        let file: ConfigFile =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("parse: {e}")))?;
        Ok(file.into_config())
    }

    pub fn with_connector(mut self, auth: ConnectorAuth) -> Self {
        self.connectors.insert(auth.token, auth.llm_api_key);
        self
    }

    pub fn with_user_key(mut self, key: impl Into<String>) -> Self {
        self.user_keys.push(key.into());
        self
    }

    /// Validate a connector token. `Some` carries the upstream credential
    /// bound to the token (possibly absent); `None` means the token is not
    /// accepted. An empty table accepts nothing.
    pub fn connector_credential(&self, token: &str) -> Option<Option<Secret<String>>> {
        self.connectors.get(token).map(|cred| cred.clone())
    }

    pub fn api_auth_enabled(&self) -> bool {
        !self.user_keys.is_empty()
    }
}

// ── File format ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default = "default_api_addr")]
    api_addr: SocketAddr,
    #[serde(default = "default_relay_addr")]
    relay_addr: SocketAddr,
    #[serde(default = "default_health_addr")]
    health_addr: SocketAddr,
    #[serde(default)]
    user_keys: Vec<String>,
    #[serde(default)]
    connectors: Vec<ConnectorEntry>,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    drain_timeout_secs: u64,
}

#[derive(Deserialize)]
struct ConnectorEntry {
    token: String,
    llm_api_key: Option<String>,
}

fn default_api_addr() -> SocketAddr {
    "0.0.0.0:8443".parse().expect("static addr")
}

fn default_relay_addr() -> SocketAddr {
    "0.0.0.0:8444".parse().expect("static addr")
}

fn default_health_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("static addr")
}

fn default_request_timeout_secs() -> u64 {
    backhaul_protocol::REQUEST_TIMEOUT_SECS
}

fn default_drain_timeout_secs() -> u64 {
    backhaul_protocol::DRAIN_TIMEOUT_SECS
}

impl ConfigFile {
    fn into_config(self) -> BrokerConfig {
        let mut config = BrokerConfig {
            api_addr: self.api_addr,
            relay_addr: self.relay_addr,
            health_addr: self.health_addr,
            user_keys: self.user_keys,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..BrokerConfig::default()
        };
        for entry in self.connectors {
            config = config.with_connector(ConnectorAuth {
                token: entry.token,
                llm_api_key: entry.llm_api_key.map(Secret::new),
            });
        }
        config
    }
}
