//! In-memory adapter for tests and embedding

use super::{AdapterFactory, PacketAdapter};
use crate::auth::ClientId;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Adapter half owned by the session
pub struct MemoryAdapter {
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// Test-side handle: injects packets the session will read and collects
/// packets the session writes
pub struct MemoryAdapterHandle {
    inject: mpsc::Sender<Bytes>,
    written: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl MemoryAdapter {
    /// Create a connected adapter and handle, each queue holding `capacity`
    /// packets
    pub fn pair(capacity: usize) -> (Self, MemoryAdapterHandle) {
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, written) = mpsc::channel(capacity);
        let closed = CancellationToken::new();

        (
            Self {
                inbound: Mutex::new(inbound),
                outbound,
                closed: closed.clone(),
            },
            MemoryAdapterHandle {
                inject,
                written,
                closed,
            },
        )
    }
}

#[async_trait]
impl PacketAdapter for MemoryAdapter {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        let packet = tokio::select! {
            _ = self.closed.cancelled() => return Ok(0),
            packet = inbound.recv() => packet,
        };

        match packet {
            Some(packet) => {
                if packet.len() > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("packet of {} bytes exceeds buffer of {}", packet.len(), buf.len()),
                    ));
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => Ok(0),
        }
    }

    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(packet.len())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

impl MemoryAdapterHandle {
    /// Queue a packet for the session to read
    pub async fn inject(&self, packet: impl Into<Bytes>) -> io::Result<()> {
        self.inject
            .send(packet.into())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// Next packet the session wrote, or `None` once the adapter is gone
    pub async fn next_written(&mut self) -> Option<Bytes> {
        self.written.recv().await
    }

    /// Whether the session has closed the adapter
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the adapter from the local side
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Factory handing out memory adapters and publishing their handles
pub struct MemoryAdapterFactory {
    capacity: usize,
    handles: mpsc::UnboundedSender<(ClientId, MemoryAdapterHandle)>,
}

impl MemoryAdapterFactory {
    pub fn new(
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<(ClientId, MemoryAdapterHandle)>) {
        let (handles, rx) = mpsc::unbounded_channel();
        (Self { capacity, handles }, rx)
    }
}

#[async_trait]
impl AdapterFactory for MemoryAdapterFactory {
    async fn open(&self, client: &ClientId) -> io::Result<Arc<dyn PacketAdapter>> {
        let (adapter, handle) = MemoryAdapter::pair(self.capacity);
        self.handles
            .send((*client, handle))
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "adapter handle receiver dropped"))?;
        Ok(Arc::new(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_and_collect() {
        let (adapter, mut handle) = MemoryAdapter::pair(8);

        handle.inject(vec![1u8, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = adapter.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        adapter.write(&[9, 9]).await.unwrap();
        assert_eq!(&handle.next_written().await.unwrap()[..], &[9, 9]);
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let (adapter, handle) = MemoryAdapter::pair(8);
        let adapter = Arc::new(adapter);

        let reader = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                adapter.read(&mut buf).await
            })
        };

        adapter.close().await;
        adapter.close().await;
        assert_eq!(reader.await.unwrap().unwrap(), 0);
        assert!(handle.is_closed());
        assert!(adapter.write(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_packet() {
        let (adapter, handle) = MemoryAdapter::pair(8);
        handle.inject(vec![0u8; 32]).await.unwrap();

        let mut buf = [0u8; 16];
        assert!(adapter.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_publishes_handles() {
        let (factory, mut handles) = MemoryAdapterFactory::new(4);
        let id = ClientId::generate().unwrap();

        let adapter = factory.open(&id).await.unwrap();
        let (opened_for, mut handle) = handles.recv().await.unwrap();
        assert_eq!(opened_for, id);

        adapter.write(b"hello").await.unwrap();
        assert_eq!(&handle.next_written().await.unwrap()[..], b"hello");
    }
}
