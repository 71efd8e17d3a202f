//! Sluice Server
//!
//! Accepts client connections (optionally over TLS), authenticates each one
//! against the issued credentials, and relays its tunnel traffic to the
//! configured local adapter endpoint. Also carries the credential admin
//! commands, which operate on the credentials file.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sluice::{
    adapter::TcpRelayFactory,
    auth::{ClientCredential, ClientId, CredentialStore},
    config::{generate_example_config, Config, ServerConfig},
    server::handle_connection,
    tunnel::{Engine, SessionOutcome},
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Timeout for dialing the adapter endpoint
const ADAPTER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the running server merges traffic into the credentials file
/// and picks up credentials changed by the admin commands
const CREDENTIAL_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Sluice Server - authenticated, encrypted VPN tunnel
#[derive(Parser, Debug)]
#[command(name = "sluice-server")]
#[command(about = "Sluice Server - authenticated, encrypted VPN tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Credential administration on the credentials file. A running server picks
/// the changes up at its next sync.
#[derive(Subcommand, Debug)]
enum Command {
    /// Write an example configuration to the --config path
    InitConfig,
    /// Issue a credential valid for DURATION (e.g. 24h, 7d, 1h30m)
    Issue { duration: String },
    /// List issued credentials
    List,
    /// Block a client
    Block { identity: String },
    /// Unblock a client
    Unblock { identity: String },
    /// Delete a client
    Delete { identity: String },
}

#[cfg(feature = "tls")]
type Acceptor = tokio_rustls::TlsAcceptor;

#[cfg(not(feature = "tls"))]
#[derive(Clone)]
enum Acceptor {}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    let log_level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level.as_str()).init();

    let server_config = config.server.clone().unwrap_or_else(|| {
        warn!("No [server] section in {}, using defaults", args.config);
        ServerConfig::default()
    });

    let store = Arc::new(CredentialStore::new());
    let credentials_path = server_config.credentials_file.clone();
    if Path::new(&credentials_path).exists() {
        let count = store
            .load_file(&credentials_path)
            .context("Failed to load credentials")?;
        info!("Loaded {} client credential(s) from {}", count, credentials_path);
    }

    match args.command {
        Some(Command::InitConfig) => init_config(&args.config),
        Some(command) => admin(command, &store, &credentials_path),
        None => run(args.listen, config, server_config, store).await,
    }
}

/// Write the example configuration, refusing to overwrite
fn init_config(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        return Err(anyhow!("{} already exists", path));
    }
    generate_example_config()
        .save(path)
        .context("Failed to write example config")?;
    println!("Wrote example configuration to {}", path);
    Ok(())
}

/// Execute one admin command against the credentials file
fn admin(command: Command, store: &CredentialStore, path: &str) -> Result<()> {
    match command {
        Command::InitConfig => return Err(anyhow!("init-config does not operate on credentials")),
        Command::Issue { duration } => {
            let credential = store
                .create_from_str(&duration)
                .context("Failed to issue credential")?;
            store.save_file(path).context("Failed to save credentials")?;
            print_issued(&credential);
        }
        Command::List => {
            let mut clients = store.list_summaries();
            clients.sort_by_key(|c| c.created_at);
            if clients.is_empty() {
                println!("No clients issued");
            }
            for client in clients {
                println!(
                    "{}  expires {}  {}  up {}  down {}",
                    client.id,
                    client.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    if client.blocked { "blocked" } else { "active " },
                    client.bytes_up,
                    client.bytes_down
                );
            }
        }
        Command::Block { identity } => {
            let id = parse_identity(&identity)?;
            if !store.block(&id) {
                return Err(anyhow!("Unknown client {}", id));
            }
            store.save_file(path).context("Failed to save credentials")?;
            println!("Blocked {}", id);
        }
        Command::Unblock { identity } => {
            let id = parse_identity(&identity)?;
            if !store.unblock(&id) {
                return Err(anyhow!("Unknown client {}", id));
            }
            store.save_file(path).context("Failed to save credentials")?;
            println!("Unblocked {}", id);
        }
        Command::Delete { identity } => {
            let id = parse_identity(&identity)?;
            if !store.delete(&id) {
                return Err(anyhow!("Unknown client {}", id));
            }
            store.save_file(path).context("Failed to save credentials")?;
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

fn parse_identity(identity: &str) -> Result<ClientId> {
    identity.parse().context("Invalid client identity")
}

/// Print a newly issued credential and the matching client config
fn print_issued(credential: &ClientCredential) {
    println!("Issued client credential (shown once, keep it secret):");
    println!();
    println!("  identity: {}", credential.id);
    println!("  secret:   {}", credential.secret.to_hex());
    println!("  key:      {}", credential.key.to_base64());
    println!("  expires:  {}", credential.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!("Add to the client's config.toml under [client]:");
    println!("  identity = \"{}\"", credential.id);
    println!("  secret = \"{}\"", credential.secret.to_hex());
    println!("  key = \"{}\"", credential.key.to_base64());
}

/// Serve tunnels until Ctrl-C
async fn run(
    listen: Option<String>,
    config: Config,
    server_config: ServerConfig,
    store: Arc<CredentialStore>,
) -> Result<()> {
    if store.is_empty() {
        warn!("No client credentials issued - server will reject all connections");
    }

    let adapters = Arc::new(TcpRelayFactory::new(
        server_config.adapter_target.clone(),
        ADAPTER_CONNECT_TIMEOUT,
    ));
    let relay_target = adapters.target().to_string();
    let engine = Arc::new(
        Engine::new(Arc::clone(&store), adapters).with_settings(config.session.settings()),
    );
    let acceptor = build_acceptor(&server_config)?;
    let semaphore = Arc::new(Semaphore::new(server_config.max_connections));
    let handshake_timeout = server_config.handshake_timeout();

    let listen_addr = listen.unwrap_or_else(|| server_config.listen.clone());

    info!("Sluice Server v{}", sluice::VERSION);
    info!("Listening on {}", listen_addr);
    info!("Relaying sessions to {}", relay_target);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    let credentials_path = server_config.credentials_file.clone();
    let mut sync = tokio::time::interval_at(
        tokio::time::Instant::now() + CREDENTIAL_SYNC_INTERVAL,
        CREDENTIAL_SYNC_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = sync.tick() => {
                if let Err(e) = store.sync_file(&credentials_path) {
                    warn!("Credential sync failed: {}", e);
                }
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);
                        stream.set_nodelay(true).ok();

                        let engine = Arc::clone(&engine);
                        let acceptor = acceptor.clone();
                        let semaphore = Arc::clone(&semaphore);
                        tokio::spawn(async move {
                            let _permit = match semaphore.acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => return,
                            };
                            match serve_stream(&engine, stream, acceptor, handshake_timeout).await {
                                Ok(outcome) => debug!("{} finished: {}", peer_addr, outcome.reason),
                                Err(e) => debug!("Connection from {} failed: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    engine.shutdown().await;
    semaphore.close();

    store
        .sync_file(&credentials_path)
        .context("Failed to save credentials")?;
    info!("Saved credentials to {}", credentials_path);

    Ok(())
}

/// Build the TLS acceptor if a certificate and key are configured
fn build_acceptor(config: &ServerConfig) -> Result<Option<Acceptor>> {
    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            #[cfg(feature = "tls")]
            {
                let acceptor = sluice::transport::tls::acceptor(cert, key)
                    .context("Failed to configure TLS")?;
                info!("TLS enabled with cert: {}", cert);
                Ok(Some(acceptor))
            }
            #[cfg(not(feature = "tls"))]
            {
                let _ = (cert, key);
                Err(anyhow!("tls_cert/tls_key are set but TLS support was not compiled in"))
            }
        }
        _ => {
            info!("TLS disabled (no tls_cert/tls_key configured)");
            Ok(None)
        }
    }
}

/// Optional TLS handshake, then hello and session
async fn serve_stream(
    engine: &Engine,
    stream: TcpStream,
    acceptor: Option<Acceptor>,
    timeout: Duration,
) -> sluice::Result<SessionOutcome> {
    match acceptor {
        #[cfg(feature = "tls")]
        Some(acceptor) => {
            let stream = sluice::transport::tls::accept(&acceptor, stream, timeout).await?;
            handle_connection(engine, stream, timeout).await
        }
        #[cfg(not(feature = "tls"))]
        Some(never) => match never {},
        None => handle_connection(engine, stream, timeout).await,
    }
}
