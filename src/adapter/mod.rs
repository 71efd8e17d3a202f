//! Packet adapters
//!
//! An adapter is the local end of a tunnel: the session reads packets from it
//! to send upstream and writes packets received from the peer into it. Each
//! `read` yields one whole packet and each `write` consumes one.

mod memory;
mod relay;

pub use memory::{MemoryAdapter, MemoryAdapterFactory, MemoryAdapterHandle};
pub use relay::{TcpRelayAdapter, TcpRelayFactory};

use crate::auth::ClientId;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// Local packet source and sink for one session
///
/// `read` and `write` are called concurrently from different tasks.
#[async_trait]
pub trait PacketAdapter: Send + Sync {
    /// Read one packet into `buf`. `Ok(0)` means the adapter has closed.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// Release the adapter. Safe to call more than once; a pending `read`
    /// returns `Ok(0)` afterwards.
    async fn close(&self);
}

/// Opens an adapter for each authenticated session
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn open(&self, client: &ClientId) -> io::Result<Arc<dyn PacketAdapter>>;
}
