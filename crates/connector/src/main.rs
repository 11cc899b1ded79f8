use std::{net::SocketAddr, sync::Arc, time::Duration};

use {anyhow::Context, clap::Parser, secrecy::Secret, tracing::{info, warn}};

use backhaul_connector::{ConnectorConfig, LlmClient, RelayClient};

/// Relay connector: bridges a local OpenAI-compatible backend to a broker.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// WebSocket URL of the broker relay endpoint.
    #[arg(long, env = "BACKHAUL_BROKER_URL")]
    broker_url: String,

    /// Connector token for broker authentication.
    #[arg(long, env = "BACKHAUL_CONNECTOR_TOKEN", hide_env_values = true)]
    token: String,

    /// Base URL of the local backend.
    #[arg(long, env = "BACKHAUL_LLM_URL", default_value = "http://localhost:11434")]
    llm_url: String,

    /// Fallback API key for the local backend (a broker-injected key wins).
    #[arg(long, env = "BACKHAUL_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// Host header override for backends behind reverse proxies.
    #[arg(long)]
    llm_host: Option<String>,

    /// Models served by this connector (repeatable). When omitted, models
    /// are discovered from the backend at startup.
    #[arg(long = "model")]
    models: Vec<String>,

    /// Bind address for the health endpoint; omit to disable.
    #[arg(long)]
    health_addr: Option<SocketAddr>,

    /// Backend request timeout in seconds.
    #[arg(long, default_value_t = backhaul_protocol::REQUEST_TIMEOUT_SECS)]
    llm_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ConnectorConfig::new(args.broker_url, args.token, args.llm_url);
    config.llm_api_key = args.llm_api_key.map(Secret::new);
    config.llm_host = args.llm_host;
    config.models = args.models;
    config.health_addr = args.health_addr;
    config.llm_timeout = Duration::from_secs(args.llm_timeout_secs);
    let config = Arc::new(config);

    let upstream = Arc::new(LlmClient::new(&config).context("failed to build backend client")?);

    // Configured models win; otherwise ask the backend what it serves.
    let models = if config.models.is_empty() {
        let discovered = upstream.discover_models().await;
        if discovered.is_empty() {
            warn!("no models discovered, connecting anyway");
        } else {
            info!(models = ?discovered, "discovered models from backend");
        }
        discovered
    } else {
        info!(models = ?config.models, "using configured models");
        config.models.clone()
    };

    let client = Arc::new(RelayClient::new(
        Arc::clone(&config),
        Arc::clone(&upstream),
        models,
    ));

    if let Some(addr) = config.health_addr {
        let state = client.state();
        let upstream = Arc::clone(&upstream);
        tokio::spawn(async move {
            if let Err(e) = backhaul_connector::health::serve(addr, state, upstream).await {
                warn!("health endpoint failed: {e}");
            }
        });
    }

    let shutdown = client.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    client.run().await?;
    Ok(())
}
