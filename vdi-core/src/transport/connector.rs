//! Stream establishment.
//!
//! The channel never touches sockets directly; it asks a [`Connector`] for
//! a boxed duplex stream. This keeps TLS optional and lets tests swap in
//! their own connectors.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ConnectError;

/// Any duplex byte stream the channel can frame.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Convenience type alias for a heap-allocated [`AsyncStream`].
pub type BoxedStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a stream to `address` (`host:port`).
    async fn connect(&self, address: &str) -> Result<BoxedStream, ConnectError>;
}

// ── TcpConnector ─────────────────────────────────────────────────

/// Plain TCP. Suitable for loopback tests and trusted links.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    async fn tcp(address: &str) -> Result<TcpStream, ConnectError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ConnectError::Refused(format!("{address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectError::Refused(format!("{address}: {e}")))?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<BoxedStream, ConnectError> {
        let stream = Self::tcp(address).await?;
        debug!(%address, "tcp stream established");
        Ok(Box::new(stream))
    }
}

// ── TlsConnector ─────────────────────────────────────────────────

/// TCP wrapped in rustls.
pub struct TlsConnector {
    config: Arc<rustls::ClientConfig>,
    /// SNI / verification name; defaults to the host part of the address.
    server_name: Option<String>,
}

impl TlsConnector {
    pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            config,
            server_name: None,
        }
    }

    /// Trust exactly one server certificate (obtained out-of-band).
    pub fn pinned(server_cert: CertificateDer<'static>) -> Result<Self, ConnectError> {
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(server_cert)
            .map_err(|e| ConnectError::TlsFailure(e.to_string()))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConnectError::TlsFailure(e.to_string()))?
            .with_root_certificates(Arc::new(roots))
            .with_no_client_auth();

        Ok(Self::new(Arc::new(config)))
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn server_name_for(&self, address: &str) -> Result<ServerName<'static>, ConnectError> {
        let name = match &self.server_name {
            Some(n) => n.clone(),
            None => host_part(address).to_string(),
        };
        ServerName::try_from(name).map_err(|e| ConnectError::TlsFailure(e.to_string()))
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, address: &str) -> Result<BoxedStream, ConnectError> {
        let name = self.server_name_for(address)?;
        let tcp = TcpConnector::tcp(address).await?;
        let tls = tokio_rustls::TlsConnector::from(Arc::clone(&self.config))
            .connect(name, tcp)
            .await
            .map_err(|e| ConnectError::TlsFailure(e.to_string()))?;
        debug!(%address, "tls stream established");
        Ok(Box::new(tls))
    }
}

/// `host` from `host:port`, `[v6]:port` or a bare host.
fn host_part(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match address.rsplit_once(':') {
        Some((host, _)) => host,
        None => address,
    }
}
