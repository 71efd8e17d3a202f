//! TCP connection setup

use super::TransportError;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `addr` within `connect_timeout`, with Nagle disabled
pub async fn connect_tcp(
    addr: &str,
    connect_timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Io)?;

    // Tunnel traffic is small packets; don't batch them
    stream.set_nodelay(true).ok();

    Ok(stream)
}
