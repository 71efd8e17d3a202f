//! Client side of a tunnel
//!
//! Dials the server, presents the issued credentials and then runs the same
//! [`TunnelSession`] the server runs, bound to a local packet adapter.

use crate::adapter::PacketAdapter;
use crate::auth::{ClientId, Secret};
use crate::config::ClientConfig;
use crate::crypto::{Cipher, ClientKey};
use crate::transport::{connect_tcp, read_reply, send_hello, Hello, StreamChannel};
use crate::tunnel::{SessionOutcome, SessionSettings, TunnelSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connects one client identity to its server
pub struct Connector {
    server: String,
    id: ClientId,
    secret: Secret,
    key: ClientKey,
    tls_sni: Option<String>,
    tls_ca: Option<String>,
    timeout: Duration,
    settings: SessionSettings,
    cancel: CancellationToken,
}

impl Connector {
    /// Build a connector from the `[client]` config section
    pub fn from_config(config: &ClientConfig, settings: SessionSettings) -> crate::Result<Self> {
        Ok(Self {
            server: config.server.clone(),
            id: config.identity.parse()?,
            secret: config.secret.parse()?,
            key: ClientKey::from_base64(&config.key)?,
            tls_sni: config.tls_sni.clone(),
            tls_ca: config.tls_ca.clone(),
            timeout: config.connect_timeout(),
            settings,
            cancel: CancellationToken::new(),
        })
    }

    /// Build a connector for plain TCP from explicit credentials
    pub fn new(server: impl Into<String>, id: ClientId, secret: Secret, key: ClientKey) -> Self {
        Self {
            server: server.into(),
            id,
            secret,
            key,
            tls_sni: None,
            tls_ca: None,
            timeout: Duration::from_secs(10),
            settings: SessionSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Stop any session this connector is running
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Dial the server and run a session until it ends
    pub async fn connect(&self, adapter: Arc<dyn PacketAdapter>) -> crate::Result<SessionOutcome> {
        info!("Connecting to {}", self.server);
        let stream = connect_tcp(&self.server, self.timeout).await?;

        match &self.tls_sni {
            #[cfg(feature = "tls")]
            Some(sni) => {
                let connector = crate::transport::tls::connector(self.tls_ca.as_deref())?;
                let stream =
                    crate::transport::tls::connect(&connector, sni, stream, self.timeout).await?;
                debug!("TLS established with {}", sni);
                self.run_on(stream, adapter).await
            }
            #[cfg(not(feature = "tls"))]
            Some(_) => Err(crate::Error::Config(
                "tls_sni is set but TLS support was not compiled in".to_string(),
            )),
            None => self.run_on(stream, adapter).await,
        }
    }

    /// Present credentials over an established stream and run the session
    pub async fn run_on<S>(
        &self,
        stream: S,
        adapter: Arc<dyn PacketAdapter>,
    ) -> crate::Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        send_hello(&mut writer, &Hello::new(self.id, self.secret.clone())).await?;
        if let Err(e) = read_reply(&mut reader, self.timeout).await {
            adapter.close().await;
            return Err(e.into());
        }
        info!("Authenticated as {}", self.id);

        let session = TunnelSession::new(
            self.id,
            Cipher::new(self.key.as_bytes())?,
            Arc::new(StreamChannel::new(reader, writer)),
            adapter,
            self.settings,
            self.cancel.child_token(),
        );

        let outcome = session.run().await;
        info!(
            "Tunnel closed: {} (up {} bytes, down {} bytes)",
            outcome.reason, outcome.bytes_up, outcome.bytes_down
        );
        Ok(outcome)
    }
}
