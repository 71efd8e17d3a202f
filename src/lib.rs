//! # Sluice
//!
//! An authenticated, encrypted VPN tunnel. Many clients tunnel IP packets to
//! one server; each client holds an issued identity, secret and symmetric key.
//!
//! ## Features
//!
//! - **Per-client credentials** with expiry, blocking and traffic accounting
//! - **XChaCha20-Poly1305** sealing of every frame with a fresh random nonce
//! - **Keepalive and liveness detection** over Ping/Pong frames
//! - **One session per identity**, newer connections evict older ones
//! - **TLS** wrapping of the transport (feature `tls`)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Session Engine                      │
//! │   (authentication, session registry, accounting)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel Session                      │
//! │        (uplink, downlink, keepalive tasks)           │
//! ├─────────────────────────────────────────────────────┤
//! │              Frame Codec + AEAD Cipher               │
//! ├──────────────────────────┬──────────────────────────┤
//! │    Transport Channel     │     Packet Adapter       │
//! │  (TCP/TLS, in-memory)    │  (TCP relay, in-memory)  │
//! └──────────────────────────┴──────────────────────────┘
//! ```

pub mod adapter;
pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listen port
pub const DEFAULT_PORT: u16 = 7443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Auth error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
