use {anyhow::Context, clap::Parser};

use backhaul_broker::{Broker, BrokerConfig};

/// Relay broker: OpenAI-compatible API in front, connector sessions behind.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Path to the broker TOML config (bind addresses, connector tokens,
    /// user keys). Falls back to the BACKHAUL_BROKER_CONFIG env var.
    #[arg(long, env = "BACKHAUL_BROKER_CONFIG", default_value = "broker.toml")]
    config: String,
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
    let config = BrokerConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;

    Broker::new(config)
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
