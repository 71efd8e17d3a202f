//! Server side of channel setup
//!
//! Reads the client hello from a fresh connection, authenticates it with the
//! [`Engine`], answers, and hands the stream to the engine as a message
//! channel.

use crate::transport::{read_hello, send_reply, HelloReply, StreamChannel};
use crate::tunnel::{Engine, SessionOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Authenticate one connection and serve it until its session ends
///
/// Rejected clients get the rejection byte and the stream is shut down.
pub async fn handle_connection<S>(
    engine: &Engine,
    stream: S,
    handshake_timeout: Duration,
) -> crate::Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let hello = read_hello(&mut reader, handshake_timeout).await?;

    let credential = match engine.authenticate(&hello.id, &hello.secret) {
        Ok(credential) => credential,
        Err(e) => {
            debug!("Rejecting client {}: {}", hello.id.short(), e);
            send_reply(&mut writer, HelloReply::Rejected).await.ok();
            writer.shutdown().await.ok();
            return Err(e.into());
        }
    };

    send_reply(&mut writer, HelloReply::Accepted).await?;

    let channel = Arc::new(StreamChannel::new(reader, writer));
    Ok(engine.serve(channel, credential).await?)
}
