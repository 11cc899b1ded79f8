//! Shared broker state handed to every handler and session task.

use std::{sync::Arc, time::Instant};

use tokio::sync::watch;

use crate::{config::BrokerConfig, registry::ConnectorRegistry, router::ModelRouter};

pub struct BrokerState {
    pub config: BrokerConfig,
    pub registry: ConnectorRegistry,
    pub router: ModelRouter,
    pub started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl BrokerState {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry: ConnectorRegistry::new(),
            router: ModelRouter::new(),
            started_at: Instant::now(),
            shutdown_tx,
        })
    }

    /// Receiver that flips to `true` exactly once, on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop taking new requests; in-flights keep draining.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.subscribe().borrow()
    }
}
