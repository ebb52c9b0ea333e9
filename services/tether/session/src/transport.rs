//! TCP and TLS transport for tether sessions.
//!
//! A session talks to exactly one `host:port` target. The stream is plain TCP
//! unless a [`TlsClientConfig`] is supplied, in which case the TCP stream is
//! wrapped in a rustls client session (requires the `tls` feature).

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Error;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Get the local address of the underlying stream
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.local_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.local_addr(),
        }
    }
}

/// Connect to a `host:port` address
pub async fn connect_tcp(addr: &str) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
    }
    Ok(stream)
}

/// Make one connection attempt, wrapping in TLS when configured
pub async fn open_stream(addr: &str, tls: Option<&TlsClientConfig>) -> Result<IoStream, Error> {
    let tcp_stream = connect_tcp(addr).await.map_err(|source| Error::Dial {
        addr: addr.to_string(),
        source,
    })?;

    match tls {
        None => Ok(IoStream::Plain(tcp_stream)),
        #[cfg(feature = "tls")]
        Some(tls_cfg) => tls::connect_tls(tls_cfg, tcp_stream)
            .await
            .map_err(|e| Error::Tls(format!("{:#}", e))),
        #[cfg(not(feature = "tls"))]
        Some(_) => Err(Error::Tls(
            "TLS requested but not compiled with TLS support".to_string(),
        )),
    }
}

/// TLS client configuration for outbound connections
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Rustls client configuration
    pub client_config: std::sync::Arc<rustls::ClientConfig>,
    /// Server name for SNI
    pub server_name: String,
}

#[cfg(not(feature = "tls"))]
#[derive(Clone)]
/// TLS client configuration for outbound connections
pub struct TlsClientConfig;

impl std::fmt::Debug for TlsClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[cfg(feature = "tls")]
        {
            f.debug_struct("TlsClientConfig")
                .field("server_name", &self.server_name)
                .finish_non_exhaustive()
        }
        #[cfg(not(feature = "tls"))]
        {
            f.write_str("TlsClientConfig")
        }
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS transport for secure client sessions
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;
    use tracing::info;

    /// Create a TLS client configuration trusting `ca_pem`.
    ///
    /// When a certificate chain and key are given the client also
    /// authenticates itself (mTLS).
    pub fn make_client_config(
        ca_pem: &str,
        client_identity: Option<(&str, &str)>,
    ) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse CA certificates")?;
        if ca_certs.is_empty() {
            anyhow::bail!("No CA certificates found");
        }
        for ca_cert in ca_certs {
            roots
                .add(ca_cert)
                .context("Failed to add CA certificate to root store")?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match client_identity {
            Some((cert_chain_pem, private_key_pem)) => {
                let cert_results: Result<Vec<CertificateDer<'static>>, _> =
                    rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
                let certs = cert_results.context("Failed to parse certificate chain")?;
                if certs.is_empty() {
                    anyhow::bail!("No certificates found in certificate chain");
                }

                let key_results: Result<Vec<_>, _> =
                    rustls_pemfile::pkcs8_private_keys(&mut private_key_pem.as_bytes()).collect();
                let mut keys = key_results.context("Failed to parse private key")?;
                if keys.is_empty() {
                    anyhow::bail!("No private key found");
                }
                let key = PrivateKeyDer::from(keys.remove(0));

                builder
                    .with_client_auth_cert(certs, key)
                    .context("Failed to configure client certificate")?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(config)
    }

    /// Wrap a connected TCP stream in a TLS client session
    pub async fn connect_tls(tls_cfg: &TlsClientConfig, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!(
            "Connecting via TLS to {} (SNI: {})",
            peer_addr, tls_cfg.server_name
        );

        let connector = TlsConnector::from(Arc::clone(&tls_cfg.client_config));
        let server_name = ServerName::try_from(tls_cfg.server_name.clone())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", tls_cfg.server_name))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| {
                format!(
                    "TLS handshake failed with {} (SNI: {})",
                    peer_addr, tls_cfg.server_name
                )
            })?;

        debug!("TLS connection established to {}", peer_addr);
        Ok(IoStream::TlsClient(Box::new(tls_stream)))
    }
}
