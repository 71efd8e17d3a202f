//! Sluice Client
//!
//! Connects to a Sluice server with an issued credential and tunnels the
//! traffic of a local adapter endpoint through it. The session ends when
//! either side closes, the peer goes silent, or on Ctrl-C; reconnecting is
//! left to whatever supervises this process.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sluice::{
    adapter::{AdapterFactory, TcpRelayFactory},
    client::Connector,
    config::Config,
};
use std::time::Duration;
use tracing::{error, info};

/// Sluice Client - authenticated, encrypted VPN tunnel
#[derive(Parser, Debug)]
#[command(name = "sluice-client")]
#[command(about = "Sluice Client - authenticated, encrypted VPN tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let log_level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level.as_str()).init();

    let mut client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(server) = args.server {
        client_config.server = server;
    }

    let connector = Connector::from_config(&client_config, config.session.settings())
        .context("Invalid client credentials in config")?;

    info!("Sluice Client v{}", sluice::VERSION);
    info!("Client identity: {}", connector.id());

    let adapter = TcpRelayFactory::new(
        client_config.adapter_target.clone(),
        Duration::from_secs(5),
    )
    .open(&connector.id())
    .await
    .with_context(|| format!("Failed to reach adapter endpoint {}", client_config.adapter_target))?;
    info!("Tunnelling traffic of {}", client_config.adapter_target);

    let session = connector.connect(adapter);
    tokio::pin!(session);

    let outcome = tokio::select! {
        result = &mut session => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            connector.shutdown();
            session.await
        }
    };

    match outcome {
        Ok(outcome) => {
            info!(
                "Session ended after {:.1?}: {} (up {} bytes, down {} bytes)",
                outcome.duration, outcome.reason, outcome.bytes_up, outcome.bytes_down
            );
            Ok(())
        }
        Err(e) => {
            error!("Tunnel failed: {}", e);
            Err(e.into())
        }
    }
}
