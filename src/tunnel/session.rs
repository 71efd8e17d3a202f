//! Tunnel session
//!
//! One authenticated peer's live connection. A session runs three tasks
//! until any of them stops:
//!
//! - uplink: adapter -> Data frame -> seal -> channel
//! - downlink: channel -> open -> frame -> adapter (answering Pings)
//! - keepalive: periodic Ping, closing the session once the peer goes quiet
//!
//! All three watch one cancellation token. The first task to stop records
//! the close reason and cancels the others; later close requests are no-ops.

use super::{
    Frame, FrameType, SessionSettings, TunnelError, DECRYPT_FAILURE_WARN_EVERY, MAX_PAYLOAD_SIZE,
};
use crate::adapter::PacketAdapter;
use crate::auth::ClientId;
use crate::crypto::Cipher;
use crate::transport::MessageChannel;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a session
///
/// A session starts `Active`; authentication happens before it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Active,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the channel cleanly
    PeerClosed,
    /// No authenticated frame from the peer within the liveness timeout
    LivenessTimeout,
    /// The packet adapter reported end of stream
    AdapterClosed,
    /// Packet adapter read or write failed
    AdapterError(String),
    /// Channel send or receive failed
    ChannelError(String),
    /// An authenticated message did not hold a valid frame
    Codec(String),
    /// Sealing an outgoing frame failed
    Crypto(String),
    /// Replaced by a newer session for the same identity
    Evicted,
    /// Engine or owner shut the session down
    Shutdown,
    /// A session task panicked
    TaskFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::LivenessTimeout => write!(f, "liveness timeout"),
            CloseReason::AdapterClosed => write!(f, "adapter closed"),
            CloseReason::AdapterError(e) => write!(f, "adapter error: {}", e),
            CloseReason::ChannelError(e) => write!(f, "channel error: {}", e),
            CloseReason::Codec(e) => write!(f, "codec error: {}", e),
            CloseReason::Crypto(e) => write!(f, "crypto error: {}", e),
            CloseReason::Evicted => write!(f, "evicted"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::TaskFailed(e) => write!(f, "task failed: {}", e),
        }
    }
}

/// Final report of a finished session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub id: ClientId,
    pub reason: CloseReason,
    /// Plaintext bytes read from the adapter and sent to the peer
    pub bytes_up: u64,
    /// Plaintext bytes received from the peer and written to the adapter
    pub bytes_down: u64,
    pub decrypt_failures: u64,
    pub duration: Duration,
}

struct Shared {
    id: ClientId,
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    decrypt_failures: AtomicU64,
    started: Instant,
    /// Milliseconds after `started` of the last authenticated inbound frame
    last_seen_ms: AtomicU64,
}

/// Cloneable view of a running session
///
/// Counters are written by the session tasks only; everything else reads.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    fn new(id: ClientId, cancel: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                state: AtomicU8::new(SessionState::Active as u8),
                reason: OnceLock::new(),
                cancel,
                bytes_up: AtomicU64::new(0),
                bytes_down: AtomicU64::new(0),
                decrypt_failures: AtomicU64::new(0),
                started: Instant::now(),
                last_seen_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Ask the session to stop
    ///
    /// Only the first request records its reason. Returns whether this call
    /// was that first request.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.shared.reason.set(reason).is_err() {
            return false;
        }
        let _ = self.shared.state.compare_exchange(
            SessionState::Active as u8,
            SessionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shared.cancel.cancel();
        true
    }

    /// Recorded close reason, if the session is closing or closed
    pub fn reason(&self) -> Option<CloseReason> {
        self.shared.reason.get().cloned()
    }

    pub fn bytes_up(&self) -> u64 {
        self.shared.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.shared.bytes_down.load(Ordering::Relaxed)
    }

    pub fn decrypt_failures(&self) -> u64 {
        self.shared.decrypt_failures.load(Ordering::Relaxed)
    }

    /// Whether two handles refer to the same session
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Time since the last authenticated frame from the peer
    pub fn idle(&self) -> Duration {
        let last_seen = Duration::from_millis(self.shared.last_seen_ms.load(Ordering::Acquire));
        self.shared.started.elapsed().saturating_sub(last_seen)
    }

    fn touch(&self) {
        let now = self.shared.started.elapsed().as_millis() as u64;
        self.shared.last_seen_ms.fetch_max(now, Ordering::AcqRel);
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    fn set_state(&self, state: SessionState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything one session task needs
#[derive(Clone)]
struct Link {
    handle: SessionHandle,
    cipher: Cipher,
    channel: Arc<dyn MessageChannel>,
    adapter: Arc<dyn PacketAdapter>,
}

impl Link {
    /// Seal a frame and send it, giving up if the session is cancelled
    async fn send_frame(&self, frame: &Frame) -> Result<(), CloseReason> {
        let sealed = self
            .cipher
            .encrypt(&frame.encode())
            .map_err(|e| CloseReason::Crypto(e.to_string()))?;

        tokio::select! {
            biased;
            _ = self.handle.cancel_token().cancelled() => Err(CloseReason::Shutdown),
            result = self.channel.send(&sealed) => {
                result.map_err(|e| CloseReason::ChannelError(e.to_string()))
            }
        }
    }
}

/// A session ready to run
pub struct TunnelSession {
    link: Link,
    settings: SessionSettings,
}

impl TunnelSession {
    /// Create a session in the `Active` state
    ///
    /// `cancel` is the session's own token; pass a child of an owner token to
    /// let the owner stop every session at once.
    pub fn new(
        id: ClientId,
        cipher: Cipher,
        channel: Arc<dyn MessageChannel>,
        adapter: Arc<dyn PacketAdapter>,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> Self {
        let settings = SessionSettings {
            keepalive_interval: settings.keepalive_interval.max(Duration::from_millis(1)),
            liveness_timeout: settings.liveness_timeout,
            mtu: settings.mtu.clamp(1, MAX_PAYLOAD_SIZE),
        };

        Self {
            link: Link {
                handle: SessionHandle::new(id, cancel),
                cipher,
                channel,
                adapter,
            },
            settings,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.link.handle.clone()
    }

    /// Run the session to completion
    pub async fn run(self) -> SessionOutcome {
        let Self { link, settings } = self;
        let handle = link.handle.clone();
        let id = handle.id();

        debug!("Session {} active", id.short());

        let tasks = [
            tokio::spawn(supervise(link.clone(), uplink(link.clone(), settings.mtu))),
            tokio::spawn(supervise(link.clone(), downlink(link.clone()))),
            tokio::spawn(supervise(link.clone(), keepalive(link.clone(), settings))),
        ];

        for task in tasks {
            if let Err(e) = task.await {
                error!("Session {} task failed: {}", id.short(), e);
                handle.close(CloseReason::TaskFailed(e.to_string()));
            }
        }

        // Cancelled from outside without a recorded reason
        handle.close(CloseReason::Shutdown);
        handle.set_state(SessionState::Closing);

        link.channel.close().await;
        link.adapter.close().await;
        handle.set_state(SessionState::Closed);

        let outcome = SessionOutcome {
            id,
            reason: handle.reason().unwrap_or(CloseReason::Shutdown),
            bytes_up: handle.bytes_up(),
            bytes_down: handle.bytes_down(),
            decrypt_failures: handle.decrypt_failures(),
            duration: handle.shared.started.elapsed(),
        };

        debug!("Session {} closed: {}", id.short(), outcome.reason);
        outcome
    }
}

/// Run one task body and close the session with whatever it returns
async fn supervise<F>(link: Link, task: F)
where
    F: std::future::Future<Output = Option<CloseReason>>,
{
    if let Some(reason) = task.await {
        link.handle.close(reason);
    }
}

/// Adapter -> channel. Returns `None` when cancelled.
async fn uplink(link: Link, mtu: usize) -> Option<CloseReason> {
    let cancel = link.handle.cancel_token().clone();
    let mut buf = vec![0u8; mtu];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = link.adapter.read(&mut buf) => match result {
                Ok(0) => return Some(CloseReason::AdapterClosed),
                Ok(n) => n,
                Err(e) => return Some(CloseReason::AdapterError(e.to_string())),
            },
        };

        let frame = Frame::data(Bytes::copy_from_slice(&buf[..n]));
        match link.send_frame(&frame).await {
            Ok(()) => {
                link.handle.shared.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
                trace!("Uplink {} bytes", n);
            }
            Err(CloseReason::Shutdown) => return None,
            Err(reason) => return Some(reason),
        }
    }
}

/// Channel -> adapter. Returns `None` when cancelled.
async fn downlink(link: Link) -> Option<CloseReason> {
    let cancel = link.handle.cancel_token().clone();

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = link.channel.receive() => match result {
                Ok(Some(message)) => message,
                Ok(None) => return Some(CloseReason::PeerClosed),
                Err(e) => return Some(CloseReason::ChannelError(e.to_string())),
            },
        };

        let plaintext = match link.cipher.decrypt(&message) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                record_decrypt_failure(&link.handle, &e);
                continue;
            }
        };

        let frame = match Frame::from_bytes(&plaintext) {
            Ok(frame) => frame,
            Err(TunnelError::UnknownFrameType(t)) => {
                link.handle.touch();
                debug!("Dropping frame of unknown type {}", t);
                continue;
            }
            Err(e) => return Some(CloseReason::Codec(e.to_string())),
        };

        link.handle.touch();

        match frame.frame_type {
            FrameType::Data => {
                let len = frame.payload.len();
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    result = link.adapter.write(&frame.payload) => result,
                };
                if let Err(e) = written {
                    return Some(CloseReason::AdapterError(e.to_string()));
                }
                link.handle.shared.bytes_down.fetch_add(len as u64, Ordering::Relaxed);
                trace!("Downlink {} bytes", len);
            }
            FrameType::Ping => {
                trace!("Ping from {}, answering", link.handle.id().short());
                match link.send_frame(&Frame::pong(frame.payload)).await {
                    Ok(()) => {}
                    Err(CloseReason::Shutdown) => return None,
                    Err(reason) => return Some(reason),
                }
            }
            FrameType::Pong => trace!("Pong from {}", link.handle.id().short()),
        }
    }
}

fn record_decrypt_failure(handle: &SessionHandle, error: &crate::crypto::CryptoError) {
    let count = handle.shared.decrypt_failures.fetch_add(1, Ordering::Relaxed) + 1;
    let id = handle.id();

    if count == 1 {
        warn!("Session {}: dropped undecryptable message: {}", id.short(), error);
    } else if count % DECRYPT_FAILURE_WARN_EVERY == 0 {
        warn!("Session {}: {} undecryptable messages dropped so far", id.short(), count);
    } else {
        debug!("Session {}: dropped undecryptable message #{}: {}", id.short(), count, error);
    }
}

/// Periodic Ping and liveness check. Returns `None` when cancelled.
async fn keepalive(link: Link, settings: SessionSettings) -> Option<CloseReason> {
    let cancel = link.handle.cancel_token().clone();
    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.keepalive_interval,
        settings.keepalive_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = ticker.tick() => {}
        }

        let idle = link.handle.idle();
        if idle > settings.liveness_timeout {
            info!(
                "Session {} silent for {:?}, closing",
                link.handle.id().short(),
                idle
            );
            return Some(CloseReason::LivenessTimeout);
        }

        sequence += 1;
        let ping = Frame::ping(Bytes::copy_from_slice(&sequence.to_be_bytes()));
        match link.send_frame(&ping).await {
            Ok(()) => trace!("Ping #{} sent", sequence),
            Err(CloseReason::Shutdown) => return None,
            Err(reason) => return Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, MemoryAdapterHandle};
    use crate::crypto::ClientKey;
    use crate::transport::MemoryChannel;

    struct Peer {
        channel: MemoryChannel,
        cipher: Cipher,
    }

    impl Peer {
        async fn send(&self, frame: Frame) {
            self.send_plain(&frame.encode()).await;
        }

        async fn send_plain(&self, plaintext: &[u8]) {
            let sealed = self.cipher.encrypt(plaintext).unwrap();
            self.channel.send(&sealed).await.unwrap();
        }

        async fn recv(&self) -> Option<Frame> {
            let message = self.channel.receive().await.unwrap()?;
            Some(Frame::from_bytes(&self.cipher.decrypt(&message).unwrap()).unwrap())
        }

        /// Next non-Ping frame
        async fn recv_skipping_pings(&self) -> Option<Frame> {
            loop {
                let frame = self.recv().await?;
                if frame.frame_type != FrameType::Ping {
                    return Some(frame);
                }
            }
        }
    }

    fn setup(settings: SessionSettings) -> (TunnelSession, Peer, MemoryAdapterHandle) {
        let key = ClientKey::generate().unwrap();
        let cipher = Cipher::new(key.as_bytes()).unwrap();
        let (local, remote) = MemoryChannel::pair();
        let (adapter, adapter_handle) = MemoryAdapter::pair(64);

        let session = TunnelSession::new(
            ClientId::generate().unwrap(),
            cipher.clone(),
            Arc::new(local),
            Arc::new(adapter),
            settings,
            CancellationToken::new(),
        );

        (
            session,
            Peer {
                channel: remote,
                cipher,
            },
            adapter_handle,
        )
    }

    #[tokio::test]
    async fn test_uplink_forwards_and_counts() {
        let (session, peer, adapter) = setup(SessionSettings::default());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        for size in [100usize, 200, 300] {
            adapter.inject(vec![size as u8; size]).await.unwrap();
        }
        for size in [100usize, 200, 300] {
            let frame = peer.recv_skipping_pings().await.unwrap();
            assert_eq!(frame.frame_type, FrameType::Data);
            assert_eq!(frame.payload.len(), size);
            assert!(frame.payload.iter().all(|&b| b == size as u8));
        }

        handle.close(CloseReason::Shutdown);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.bytes_up, 600);
        assert_eq!(outcome.bytes_down, 0);
        assert_eq!(outcome.reason, CloseReason::Shutdown);
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_downlink_writes_and_counts() {
        let (session, peer, mut adapter) = setup(SessionSettings::default());
        let task = tokio::spawn(session.run());

        peer.send(Frame::data(Bytes::from_static(b"first packet"))).await;
        peer.send(Frame::data(Bytes::from_static(b"second"))).await;

        assert_eq!(&adapter.next_written().await.unwrap()[..], b"first packet");
        assert_eq!(&adapter.next_written().await.unwrap()[..], b"second");

        peer.channel.close().await;
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::PeerClosed);
        assert_eq!(outcome.bytes_down, 18);
        assert!(adapter.is_closed());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (session, peer, _adapter) = setup(SessionSettings::default());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        peer.send(Frame::ping(Bytes::from_static(b"ping"))).await;
        let pong = peer.recv_skipping_pings().await.unwrap();
        assert_eq!(pong.frame_type, FrameType::Pong);
        assert_eq!(&pong.payload[..], b"ping");

        handle.close(CloseReason::Shutdown);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_undecryptable_message_dropped() {
        let (session, peer, mut adapter) = setup(SessionSettings::default());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        let mut sealed = peer
            .cipher
            .encrypt(&Frame::data(Bytes::from_static(b"tampered")).encode())
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        peer.channel.send(&sealed).await.unwrap();
        peer.channel.send(&[0u8; 3]).await.unwrap();

        peer.send(Frame::data(Bytes::from_static(b"intact"))).await;
        assert_eq!(&adapter.next_written().await.unwrap()[..], b"intact");
        assert_eq!(handle.decrypt_failures(), 2);
        assert_eq!(handle.state(), SessionState::Active);

        handle.close(CloseReason::Shutdown);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.decrypt_failures, 2);
        assert_eq!(outcome.bytes_down, 6);
    }

    #[tokio::test]
    async fn test_unknown_frame_type_ignored() {
        let (session, peer, mut adapter) = setup(SessionSettings::default());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        peer.send_plain(&[0, 0, 0, 3, 9, 1, 2]).await;
        peer.send(Frame::data(Bytes::from_static(b"after"))).await;
        assert_eq!(&adapter.next_written().await.unwrap()[..], b"after");

        handle.close(CloseReason::Shutdown);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_inner_frame_is_fatal() {
        let (session, peer, _adapter) = setup(SessionSettings::default());
        let task = tokio::spawn(session.run());

        peer.send_plain(&[0, 0, 0, 0]).await;
        let outcome = task.await.unwrap();
        assert!(matches!(outcome.reason, CloseReason::Codec(_)));
    }

    #[tokio::test]
    async fn test_adapter_close_ends_session() {
        let (session, peer, adapter) = setup(SessionSettings::default());
        let task = tokio::spawn(session.run());

        adapter.close();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::AdapterClosed);

        // The channel is released too
        assert!(peer.channel.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _peer, _adapter) = setup(SessionSettings::default());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        assert!(handle.close(CloseReason::Evicted));
        assert!(!handle.close(CloseReason::Shutdown));
        assert!(!handle.close(CloseReason::LivenessTimeout));

        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Evicted);
        assert_eq!(handle.reason(), Some(CloseReason::Evicted));
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_external_cancel_reports_shutdown() {
        let key = ClientKey::generate().unwrap();
        let (local, _remote) = MemoryChannel::pair();
        let (adapter, _adapter_handle) = MemoryAdapter::pair(4);
        let owner = CancellationToken::new();

        let session = TunnelSession::new(
            ClientId::generate().unwrap(),
            Cipher::new(key.as_bytes()).unwrap(),
            Arc::new(local),
            Arc::new(adapter),
            SessionSettings::default(),
            owner.child_token(),
        );
        let task = tokio::spawn(session.run());

        owner.cancel();
        assert_eq!(task.await.unwrap().reason, CloseReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_with_sequence() {
        let (session, peer, _adapter) = setup(SessionSettings::default());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        let first = peer.recv().await.unwrap();
        assert_eq!(first.frame_type, FrameType::Ping);
        assert_eq!(&first.payload[..], &1u64.to_be_bytes());

        peer.send(Frame::pong(first.payload)).await;

        let second = peer.recv().await.unwrap();
        assert_eq!(second.frame_type, FrameType::Ping);
        assert_eq!(&second.payload[..], &2u64.to_be_bytes());

        handle.close(CloseReason::Shutdown);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (session, _peer, _adapter) = setup(SessionSettings::default());
        let started = Instant::now();

        let outcome = session.run().await;
        assert_eq!(outcome.reason, CloseReason::LivenessTimeout);
        assert!(started.elapsed() > Duration::from_secs(30));
        assert!(started.elapsed() <= Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_pings_keep_session_alive() {
        let (session, peer, _adapter) = setup(SessionSettings::default());
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        for _ in 0..6 {
            let ping = peer.recv().await.unwrap();
            peer.send(Frame::pong(ping.payload)).await;
        }
        assert_eq!(handle.state(), SessionState::Active);

        handle.close(CloseReason::Shutdown);
        assert_eq!(task.await.unwrap().reason, CloseReason::Shutdown);
    }
}
