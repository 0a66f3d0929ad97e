//! Relay Application
//!
//! Accepts voice clients and forwards each client's audio to all others.
//!
//! Usage: `relay [host:port]` (defaults come from the config file)

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_voice_relay::{config::AppConfig, network::relay::RelayServer};

fn parse_endpoint(arg: &str, default_port: u16) -> Result<(String, u16)> {
    match arg.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in {}", arg))?;
            Ok((host.to_string(), port))
        }
        None => Ok((arg.to_string(), default_port)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Voice Relay");

    let config = AppConfig::load_or_default()?;
    config.validate()?;

    let (host, port) = match std::env::args().nth(1) {
        Some(arg) => parse_endpoint(&arg, config.relay.port)?,
        None => (config.relay.host.clone(), config.relay.port),
    };

    let mut relay = RelayServer::new(config.relay.clone());
    if !relay.start(&host, port) {
        anyhow::bail!("Could not start relay on {}:{}", host, port);
    }

    tracing::info!("Relay running - press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    relay.stop();
    let stats = relay.stats();
    tracing::info!(
        "Served {} connections, relayed {} chunks ({} dropped), {:.1} KB in, {:.1} KB out",
        stats.connections_accepted,
        stats.chunks_relayed,
        stats.chunks_dropped,
        stats.bytes_received as f64 / 1024.0,
        stats.bytes_sent as f64 / 1024.0
    );
    Ok(())
}
