//! Session engine
//!
//! Authenticates incoming channels against the credential store, runs one
//! [`TunnelSession`] per client identity and folds each session's traffic
//! back into the store when it ends.

use super::{
    CloseReason, SessionHandle, SessionOutcome, SessionSettings, TunnelError, TunnelSession,
};
use crate::adapter::AdapterFactory;
use crate::auth::{AuthError, ClientCredential, ClientId, CredentialStore, Secret};
use crate::crypto::Cipher;
use crate::transport::MessageChannel;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Registry of live sessions
///
/// At most one session per identity: a newer session for the same identity
/// evicts the older one.
pub struct Engine {
    store: Arc<CredentialStore>,
    adapters: Arc<dyn AdapterFactory>,
    settings: SessionSettings,
    sessions: DashMap<ClientId, SessionHandle>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Engine {
    pub fn new(store: Arc<CredentialStore>, adapters: Arc<dyn AdapterFactory>) -> Self {
        Self {
            store,
            adapters,
            settings: SessionSettings::default(),
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Check a claimed identity and secret
    ///
    /// Unknown, blocked, expired and wrong-secret claims all fail the same way.
    pub fn authenticate(
        &self,
        id: &ClientId,
        secret: &Secret,
    ) -> Result<ClientCredential, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::ShuttingDown);
        }
        self.store.verify(id, secret).ok_or_else(|| {
            debug!("Rejected credentials for client {}", id.short());
            TunnelError::Auth(AuthError::Unauthenticated)
        })
    }

    /// Authenticate and serve a channel until its session ends
    pub async fn accept(
        &self,
        channel: Arc<dyn MessageChannel>,
        id: ClientId,
        secret: Secret,
    ) -> Result<SessionOutcome, TunnelError> {
        let credential = match self.authenticate(&id, &secret) {
            Ok(credential) => credential,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        self.serve(channel, credential).await
    }

    /// Serve a channel for an already authenticated credential
    ///
    /// Returns when the session has closed and its counters are flushed.
    pub async fn serve(
        &self,
        channel: Arc<dyn MessageChannel>,
        credential: ClientCredential,
    ) -> Result<SessionOutcome, TunnelError> {
        let _in_flight = self.tracker.token();
        let id = credential.id;

        if self.shutdown.is_cancelled() {
            channel.close().await;
            return Err(TunnelError::ShuttingDown);
        }

        let cipher = match Cipher::new(credential.key.as_bytes()) {
            Ok(cipher) => cipher,
            Err(e) => {
                channel.close().await;
                return Err(e.into());
            }
        };

        let adapter = match self.adapters.open(&id).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Failed to open adapter for client {}: {}", id, e);
                channel.close().await;
                return Err(TunnelError::Adapter(e));
            }
        };

        let session = TunnelSession::new(
            id,
            cipher,
            channel,
            adapter,
            self.settings,
            self.shutdown.child_token(),
        );
        let handle = session.handle();

        if let Some(previous) = self.sessions.insert(id, handle.clone()) {
            info!("Client {} reconnected, evicting previous session", id);
            previous.close(CloseReason::Evicted);
        }
        info!("Session started for client {} ({} active)", id, self.sessions.len());

        let outcome = session.run().await;

        self.sessions
            .remove_if(&id, |_, current| current.same_session(&handle));
        self.store.accumulate(&id, outcome.bytes_up, outcome.bytes_down);

        info!(
            "Session ended for client {}: {} (up {} bytes, down {} bytes, {:.1?})",
            id, outcome.reason, outcome.bytes_up, outcome.bytes_down, outcome.duration
        );
        if outcome.decrypt_failures > 0 {
            warn!(
                "Client {} session dropped {} undecryptable messages",
                id, outcome.decrypt_failures
            );
        }

        Ok(outcome)
    }

    /// Stop every session and wait until all have flushed their counters
    ///
    /// New sessions are refused from the moment this is called.
    pub async fn shutdown(&self) {
        info!("Shutting down {} session(s)", self.sessions.len());
        self.shutdown.cancel();

        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            handle.close(CloseReason::Shutdown);
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("All sessions closed");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Identities with a live session
    pub fn active_identities(&self) -> Vec<ClientId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Handle of the live session for `id`
    pub fn session(&self, id: &ClientId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapterFactory, MemoryAdapterHandle};
    use crate::transport::MemoryChannel;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Handles = mpsc::UnboundedReceiver<(ClientId, MemoryAdapterHandle)>;

    /// The returned receiver keeps opened adapters alive
    fn engine() -> (Arc<Engine>, ClientCredential, Handles) {
        let store = Arc::new(CredentialStore::new());
        let credential = store.create_from_str("1h").unwrap();
        let (factory, handles) = MemoryAdapterFactory::new(16);
        (Arc::new(Engine::new(store, Arc::new(factory))), credential, handles)
    }

    async fn wait_for_sessions(engine: &Engine, count: usize) {
        while engine.session_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_authenticate() {
        let (engine, credential, _handles) = engine();

        assert!(engine.authenticate(&credential.id, &credential.secret).is_ok());
        assert!(matches!(
            engine.authenticate(&credential.id, &Secret::generate().unwrap()),
            Err(TunnelError::Auth(AuthError::Unauthenticated))
        ));
        assert!(matches!(
            engine.authenticate(&ClientId::generate().unwrap(), &credential.secret),
            Err(TunnelError::Auth(AuthError::Unauthenticated))
        ));

        engine.store().block(&credential.id);
        assert!(matches!(
            engine.authenticate(&credential.id, &credential.secret),
            Err(TunnelError::Auth(AuthError::Unauthenticated))
        ));
    }

    #[tokio::test]
    async fn test_rejected_accept_closes_channel() {
        let (engine, credential, _handles) = engine();
        let (local, remote) = MemoryChannel::pair();

        let result = engine
            .accept(Arc::new(local), credential.id, Secret::generate().unwrap())
            .await;
        assert!(matches!(result, Err(TunnelError::Auth(AuthError::Unauthenticated))));
        assert_eq!(engine.session_count(), 0);
        assert!(remote.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_session_evicts_first() {
        let (engine, credential, _handles) = engine();

        let (first_local, _first_remote) = MemoryChannel::pair();
        let first = {
            let engine = Arc::clone(&engine);
            let (id, secret) = (credential.id, credential.secret.clone());
            tokio::spawn(async move { engine.accept(Arc::new(first_local), id, secret).await })
        };
        wait_for_sessions(&engine, 1).await;
        let first_handle = engine.session(&credential.id).unwrap();

        let (second_local, _second_remote) = MemoryChannel::pair();
        let second = {
            let engine = Arc::clone(&engine);
            let (id, secret) = (credential.id, credential.secret.clone());
            tokio::spawn(async move { engine.accept(Arc::new(second_local), id, secret).await })
        };

        let first_outcome = first.await.unwrap().unwrap();
        assert_eq!(first_outcome.reason, CloseReason::Evicted);

        // The replacement stays registered after the evicted session cleans up
        wait_for_sessions(&engine, 1).await;
        let current = engine.session(&credential.id).unwrap();
        assert!(!current.same_session(&first_handle));
        assert_eq!(engine.active_identities(), vec![credential.id]);

        engine.shutdown().await;
        assert_eq!(second.await.unwrap().unwrap().reason, CloseReason::Shutdown);
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_sessions() {
        let (engine, credential, _handles) = engine();
        engine.shutdown().await;
        assert!(engine.is_shutting_down());

        let (local, _remote) = MemoryChannel::pair();
        let result = engine
            .accept(Arc::new(local), credential.id, credential.secret.clone())
            .await;
        assert!(matches!(result, Err(TunnelError::ShuttingDown)));
    }
}
