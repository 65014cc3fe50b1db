//! Local TLS termination.
//!
//! The handshake reads the ClientHello the sniffer already buffered, because
//! the sniffable connection replays it from offset 0. The decrypted stream
//! replaces the raw connection from then on.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::cancelled;
use super::sniffable::SniffableConn;
use super::transport::BoxTransport;
use crate::error::{GatewayError, Result};

/// Default bound on a TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns a sniffed connection into a decrypted transport.
#[async_trait]
pub trait TlsTerminator: Send + Sync {
    /// Complete the server handshake. Returns [`GatewayError::Cancelled`]
    /// if `shutdown` fires first, dropping (and so closing) the connection.
    async fn accept(
        &self,
        conn: SniffableConn,
        config: Arc<rustls::ServerConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<BoxTransport>;
}

/// rustls-backed terminator.
#[derive(Debug, Clone)]
pub struct RustlsTerminator {
    handshake_timeout: Duration,
}

impl RustlsTerminator {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Default for RustlsTerminator {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

#[async_trait]
impl TlsTerminator for RustlsTerminator {
    async fn accept(
        &self,
        conn: SniffableConn,
        config: Arc<rustls::ServerConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<BoxTransport> {
        let stream_id = conn.stats().id();
        let handshake = TlsAcceptor::from(config).accept(conn);

        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => {
                debug!(stream_id, "TLS handshake cancelled by shutdown");
                Err(GatewayError::Cancelled)
            }
            result = timeout(self.handshake_timeout, handshake) => match result {
                Ok(Ok(tls)) => {
                    let (_, session) = tls.get_ref();
                    debug!(
                        stream_id,
                        sni = session.server_name().unwrap_or(""),
                        alpn = ?session.alpn_protocol().map(String::from_utf8_lossy),
                        "TLS terminated"
                    );
                    Ok(Box::new(tls))
                }
                Ok(Err(err)) => Err(GatewayError::Tls(err)),
                Err(_) => Err(GatewayError::Tls(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("handshake exceeded {:?}", self.handshake_timeout),
                ))),
            },
        }
    }
}

/// Build a server config from PEM-decoded material with the ring provider.
pub fn server_config(
    certs: Vec<rustls::pki_types::CertificateDer<'static>>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
) -> std::result::Result<Arc<rustls::ServerConfig>, rustls::Error> {
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}
