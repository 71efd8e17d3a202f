//! TCP relay adapter
//!
//! Forwards tunnel traffic to a local TCP service (for example a userspace
//! TUN bridge). Each read hands back whatever bytes arrived; each write is
//! written out whole. The remote service sees one byte stream per session.

use super::{AdapterFactory, PacketAdapter};
use crate::auth::ClientId;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Adapter over one TCP connection
pub struct TcpRelayAdapter {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl TcpRelayAdapter {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl PacketAdapter for TcpRelayAdapter {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(0),
            result = reader.read(buf) => result,
        }
    }

    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await?;
        Ok(packet.len())
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.writer.lock().await.shutdown().await.ok();
    }
}

/// Dials `target` for every session
pub struct TcpRelayFactory {
    target: String,
    connect_timeout: Duration,
}

impl TcpRelayFactory {
    pub fn new(target: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            connect_timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl AdapterFactory for TcpRelayFactory {
    async fn open(&self, client: &ClientId) -> io::Result<Arc<dyn PacketAdapter>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "adapter connect timed out"))??;

        debug!("Opened relay to {} for client {}", self.target, client.short());
        Ok(Arc::new(TcpRelayAdapter::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_relay_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let factory = TcpRelayFactory::new(
            listener.local_addr().unwrap().to_string(),
            Duration::from_secs(5),
        );

        let service = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"reply").await.unwrap();
            buf
        });

        let adapter = factory.open(&ClientId::generate().unwrap()).await.unwrap();
        adapter.write(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 5 {
            let n = adapter.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"reply");
        assert_eq!(&service.await.unwrap(), b"hello");

        adapter.close().await;
        assert_eq!(adapter.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let factory = TcpRelayFactory::new(addr, Duration::from_secs(5));
        assert!(factory.open(&ClientId::generate().unwrap()).await.is_err());
    }
}
