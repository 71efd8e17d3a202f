//! Message framing over a byte stream
//!
//! Wire format: `length (4B, big endian) || message`.

use super::{MessageChannel, TransportError, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

/// Message channel over split read/write halves
pub struct StreamChannel<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    closed: AtomicBool,
}

impl<R, W> StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> MessageChannel for StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(message.len()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        // Coalesce length prefix + message into a single write
        let mut wire_buf = Vec::with_capacity(4 + message.len());
        wire_buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
        wire_buf.extend_from_slice(message);

        let mut writer = self.writer.lock().await;
        writer.write_all(&wire_buf).await?;
        writer.flush().await?;

        trace!("Sent message ({} bytes)", message.len());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Bytes>, TransportError> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(len));
        }

        let mut message = vec![0u8; len];
        reader.read_exact(&mut message).await?;

        trace!("Received message ({} bytes)", len);
        Ok(Some(Bytes::from(message)))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type DuplexChannel = StreamChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (DuplexChannel, DuplexChannel) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (StreamChannel::new(ar, aw), StreamChannel::new(br, bw))
    }

    #[tokio::test]
    async fn test_send_receive() {
        let (a, b) = pair();

        a.send(b"first").await.unwrap();
        a.send(b"").await.unwrap();
        a.send(&vec![7u8; 70_000]).await.unwrap();

        assert_eq!(&b.receive().await.unwrap().unwrap()[..], b"first");
        assert!(b.receive().await.unwrap().unwrap().is_empty());
        assert_eq!(b.receive().await.unwrap().unwrap().len(), 70_000);
    }

    #[tokio::test]
    async fn test_clean_close() {
        let (a, b) = pair();
        a.send(b"last").await.unwrap();
        a.close().await;
        a.close().await;

        assert_eq!(&b.receive().await.unwrap().unwrap()[..], b"last");
        assert!(b.receive().await.unwrap().is_none());
        assert!(matches!(a.send(b"more").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (a, _b) = pair();
        let huge = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            a.send(&huge).await,
            Err(TransportError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_announcement_rejected() {
        let (local, mut remote) = tokio::io::duplex(64);
        let channel = StreamChannel::new(local, tokio::io::sink());

        remote.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            channel.receive().await,
            Err(TransportError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_prefix() {
        let (local, mut remote) = tokio::io::duplex(64);
        let channel = StreamChannel::new(local, tokio::io::sink());

        remote.write_all(&[0, 0]).await.unwrap();
        drop(remote);
        assert!(matches!(channel.receive().await, Err(TransportError::Io(_))));
    }
}
