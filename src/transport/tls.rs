//! TLS wrapping for the stream transport
//!
//! The server presents a PEM certificate chain; the client verifies it
//! against either a configured CA bundle or the public web PKI roots.

use super::TransportError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::info;

/// Load a certificate chain from a PEM file
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open cert file {}: {}", path, e)))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!("No certificates found in {}", path)));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load a private key from a PEM file
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open key file {}: {}", path, e)))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| TransportError::Tls(format!("No private key found in {}", path)))
}

/// Build a server-side acceptor from a certificate chain and key
pub fn acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("Failed to build TLS server config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Run the server TLS handshake on an accepted TCP stream
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
) -> Result<server::TlsStream<TcpStream>, TransportError> {
    tokio::time::timeout(timeout, acceptor.accept(stream))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Build a client-side connector
///
/// With `ca_path` set only that bundle is trusted; otherwise the bundled
/// web PKI roots are.
pub fn connector(ca_path: Option<&str>) -> Result<TlsConnector, TransportError> {
    let mut roots = RootCertStore::empty();
    match ca_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("Invalid CA certificate: {}", e)))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the client TLS handshake over an established TCP stream
pub async fn connect(
    connector: &TlsConnector,
    sni: &str,
    stream: TcpStream,
    timeout: Duration,
) -> Result<client::TlsStream<TcpStream>, TransportError> {
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|e| TransportError::Tls(format!("Invalid SNI: {}", e)))?;

    tokio::time::timeout(timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_with_web_roots() {
        assert!(connector(None).is_ok());
    }

    #[test]
    fn test_missing_files() {
        assert!(matches!(
            load_certs("/nonexistent/cert.pem"),
            Err(TransportError::Tls(_))
        ));
        assert!(matches!(
            acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem"),
            Err(TransportError::Tls(_))
        ));
        assert!(matches!(
            connector(Some("/nonexistent/ca.pem")),
            Err(TransportError::Tls(_))
        ));
    }

    #[test]
    fn test_empty_pem() {
        let path = std::env::temp_dir().join("sluice-empty-cert.pem");
        std::fs::write(&path, "").unwrap();
        let result = load_certs(path.to_str().unwrap());
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }
}
