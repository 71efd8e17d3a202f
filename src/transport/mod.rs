//! Transport channel implementations
//!
//! The tunnel treats its transport as a duplex stream of opaque messages.
//! Provides:
//! - Length-prefixed message framing over any byte stream (TCP, TLS)
//! - An in-process channel pair for tests and embedding
//! - The hello exchange that carries client credentials at channel setup
//! - TLS wrapping (feature `tls`)

mod hello;
mod memory;
mod stream;
mod tcp;

#[cfg(feature = "tls")]
pub mod tls;

pub use hello::{read_hello, read_reply, send_hello, send_reply, Hello, HelloReply, HELLO_LEN};
pub use memory::MemoryChannel;
pub use stream::StreamChannel;
pub use tcp::connect_tcp;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

/// Largest message accepted on a channel: one maximum frame plus nonce and tag
pub const MAX_MESSAGE_SIZE: usize =
    crate::tunnel::MAX_ENCODED_SIZE + crate::crypto::SEAL_OVERHEAD;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Message too large: {0} > {}", MAX_MESSAGE_SIZE)]
    MessageTooLarge(usize),

    #[error("Malformed handshake: {0}")]
    Handshake(String),

    #[error("Connection rejected by server")]
    Rejected,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A full-duplex channel of whole messages
///
/// `send` and `receive` may be called concurrently from different tasks.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Send one message
    async fn send(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Receive one message; `None` means the peer closed cleanly
    async fn receive(&self) -> Result<Option<Bytes>, TransportError>;

    /// Close the channel. Safe to call more than once.
    async fn close(&self);
}
