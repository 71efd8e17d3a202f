//! Tunnel layer - the per-client encrypted forwarding session
//!
//! Provides:
//! - Frame encoding/decoding
//! - The tunnel session (packet forwarding in both directions plus keepalive)
//! - The engine that authenticates channels and tracks live sessions

mod engine;
mod frame;
mod session;

pub use engine::Engine;
pub use frame::{
    Frame, FrameType, LENGTH_PREFIX_SIZE, MAX_ENCODED_SIZE, MAX_FRAME_LEN, MAX_PAYLOAD_SIZE,
};
pub use session::{CloseReason, SessionHandle, SessionOutcome, SessionState, TunnelSession};

use crate::auth::AuthError;
use crate::crypto::CryptoError;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame truncated")]
    Truncated,

    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Packet adapter error: {0}")]
    Adapter(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Interval between keepalive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Silence after which the peer is presumed dead
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default adapter read buffer (one packet)
pub const DEFAULT_MTU: usize = 1500;

/// Decrypt failures between summary warnings
pub const DECRYPT_FAILURE_WARN_EVERY: u64 = 16;

/// Per-session timing and buffer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub keepalive_interval: Duration,
    pub liveness_timeout: Duration,
    pub mtu: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            liveness_timeout: LIVENESS_TIMEOUT,
            mtu: DEFAULT_MTU,
        }
    }
}
