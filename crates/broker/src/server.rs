//! Broker wiring: three listeners (API, relay, health) and the shutdown
//! drain.

use std::{sync::Arc, time::Duration};

use {
    tokio::net::TcpListener,
    tracing::{info, warn},
};

use backhaul_protocol::codes;

use crate::{
    api, config::BrokerConfig, error::Result, health, relay, state::BrokerState,
};

pub struct Broker {
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: BrokerState::new(config),
        }
    }

    pub fn state(&self) -> Arc<BrokerState> {
        Arc::clone(&self.state)
    }

    /// External OpenAI-compatible API router (shared with tests).
    pub fn api_router(&self) -> axum::Router {
        api::router(self.state())
    }

    /// Connector relay router exposing `/ws` (shared with tests).
    pub fn relay_router(&self) -> axum::Router {
        relay::router(self.state())
    }

    /// Health/readiness router (shared with tests).
    pub fn health_router(&self) -> axum::Router {
        health::router(self.state())
    }

    /// Serve all three listeners until the shutdown signal fires, then
    /// drain in-flight requests within the configured deadline.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
        let state = self.state();

        let api_listener = TcpListener::bind(state.config.api_addr).await?;
        let relay_listener = TcpListener::bind(state.config.relay_addr).await?;
        let health_listener = TcpListener::bind(state.config.health_addr).await?;
        info!(
            api = %state.config.api_addr,
            relay = %state.config.relay_addr,
            health = %state.config.health_addr,
            "broker listening"
        );

        let serve = |listener: TcpListener, router: axum::Router| {
            let mut signal = state.shutdown_signal();
            tokio::spawn(async move {
                let graceful = async move {
                    // Wait for the flag to flip; a closed channel also stops.
                    while !*signal.borrow_and_update() {
                        if signal.changed().await.is_err() {
                            break;
                        }
                    }
                };
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(graceful)
                    .await
                {
                    warn!("listener error: {e}");
                }
            })
        };

        let api_task = serve(api_listener, self.api_router());
        let relay_task = serve(relay_listener, self.relay_router());
        let health_task = serve(health_listener, self.health_router());

        shutdown.await;
        info!("shutdown signal received");
        state.begin_shutdown();

        drain(&state).await;

        let _ = tokio::join!(api_task, relay_task, health_task);
        info!("broker stopped");
        Ok(())
    }
}

/// Let in-flight requests finish within the drain deadline, then fail the
/// remainder.
async fn drain(state: &Arc<BrokerState>) {
    let deadline = tokio::time::Instant::now() + state.config.drain_timeout;
    loop {
        let remaining = state.registry.in_flight_total();
        if remaining == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(remaining, "drain deadline reached, failing remaining requests");
            for session in state.registry.all() {
                session.fail_all(503, "broker is shutting down", codes::SHUTDOWN);
            }
            break;
        }
        info!(remaining, "draining in-flight requests");
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
