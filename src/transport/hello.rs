//! Channel-setup hello
//!
//! Before any tunnel message the client sends its identity and secret in the
//! clear (the outer TLS layer protects them), and the server answers with a
//! single status byte:
//!
//! ```text
//! client -> server:  identity (16B) || secret (16B)
//! server -> client:  0x00 accepted | 0x01 rejected
//! ```

use super::TransportError;
use crate::auth::{ClientId, Secret, ID_LEN, SECRET_LEN};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the hello message on the wire
pub const HELLO_LEN: usize = ID_LEN + SECRET_LEN;

const REPLY_ACCEPTED: u8 = 0x00;
const REPLY_REJECTED: u8 = 0x01;

/// Credentials presented by a connecting client
#[derive(Debug, Clone)]
pub struct Hello {
    pub id: ClientId,
    pub secret: Secret,
}

impl Hello {
    pub fn new(id: ClientId, secret: Secret) -> Self {
        Self { id, secret }
    }

    fn encode(&self) -> [u8; HELLO_LEN] {
        let mut buf = [0u8; HELLO_LEN];
        buf[..ID_LEN].copy_from_slice(self.id.as_bytes());
        buf[ID_LEN..].copy_from_slice(self.secret.as_bytes());
        buf
    }

    fn decode(buf: &[u8; HELLO_LEN]) -> Self {
        let mut id = [0u8; ID_LEN];
        let mut secret = [0u8; SECRET_LEN];
        id.copy_from_slice(&buf[..ID_LEN]);
        secret.copy_from_slice(&buf[ID_LEN..]);
        Self {
            id: ClientId::from_bytes(id),
            secret: Secret::from_bytes(secret),
        }
    }
}

/// Server verdict on a hello
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloReply {
    Accepted,
    Rejected,
}

/// Send the client hello
pub async fn send_hello<W>(writer: &mut W, hello: &Hello) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&hello.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a client hello, giving up after `timeout`
pub async fn read_hello<R>(reader: &mut R, timeout: Duration) -> Result<Hello, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HELLO_LEN];
    tokio::time::timeout(timeout, reader.read_exact(&mut buf))
        .await
        .map_err(|_| TransportError::Timeout)??;
    Ok(Hello::decode(&buf))
}

/// Send the server verdict
pub async fn send_reply<W>(writer: &mut W, reply: HelloReply) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let byte = match reply {
        HelloReply::Accepted => REPLY_ACCEPTED,
        HelloReply::Rejected => REPLY_REJECTED,
    };
    writer.write_all(&[byte]).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the server verdict; a rejection is reported as an error
pub async fn read_reply<R>(reader: &mut R, timeout: Duration) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    tokio::time::timeout(timeout, reader.read_exact(&mut byte))
        .await
        .map_err(|_| TransportError::Timeout)??;

    match byte[0] {
        REPLY_ACCEPTED => Ok(()),
        REPLY_REJECTED => Err(TransportError::Rejected),
        other => Err(TransportError::Handshake(format!(
            "unexpected reply byte {:#04x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_hello_exchange() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let hello = Hello::new(ClientId::generate().unwrap(), Secret::generate().unwrap());

        send_hello(&mut client, &hello).await.unwrap();
        let received = read_hello(&mut server, TIMEOUT).await.unwrap();
        assert_eq!(received.id, hello.id);
        assert!(received.secret.verify(&hello.secret));

        send_reply(&mut server, HelloReply::Accepted).await.unwrap();
        read_reply(&mut client, TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        send_reply(&mut server, HelloReply::Rejected).await.unwrap();
        assert!(matches!(
            read_reply(&mut client, TIMEOUT).await,
            Err(TransportError::Rejected)
        ));
    }

    #[tokio::test]
    async fn test_garbage_reply() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0x7f]).await.unwrap();
        assert!(matches!(
            read_reply(&mut client, TIMEOUT).await,
            Err(TransportError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_short_hello() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_hello(&mut server, TIMEOUT).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_timeout() {
        let (_client, mut server) = tokio::io::duplex(64);
        assert!(matches!(
            read_hello(&mut server, TIMEOUT).await,
            Err(TransportError::Timeout)
        ));
    }
}
