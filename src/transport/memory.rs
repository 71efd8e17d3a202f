//! In-process message channel

use super::{MessageChannel, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 256;

/// One end of an in-memory duplex channel
///
/// Closing an end drops its sender, so the peer's `receive` returns `None`
/// once the queued messages are drained. It also closes its receiver, so the
/// peer's `send` fails with `Closed` instead of filling the queue.
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
}

impl MemoryChannel {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);

        (
            Self {
                tx: Mutex::new(Some(a_tx)),
                rx: Mutex::new(a_rx),
                closed: CancellationToken::new(),
            },
            Self {
                tx: Mutex::new(Some(b_tx)),
                rx: Mutex::new(b_rx),
                closed: CancellationToken::new(),
            },
        )
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.lock().await.clone().ok_or(TransportError::Closed)?;
        tx.send(Bytes::copy_from_slice(message))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Option<Bytes>, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                rx.close();
                Ok(None)
            }
            message = rx.recv() => Ok(message),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.tx.lock().await.take();
        // A pending receive holds the lock and closes the receiver itself
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}
