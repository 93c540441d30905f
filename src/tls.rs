//! Server-side TLS: PEM loading, rustls configuration, and the stream
//! type sessions run over.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use pem::parse_many as pem_parse_many;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::config::TlsSettings;
use crate::error::ServerError;

/// Builds the rustls server configuration from the configured PEM files.
/// Fails startup if either file is unreadable or unparsable.
pub fn load_server_config(settings: &TlsSettings) -> Result<rustls::ServerConfig, ServerError> {
    let cert_chain = load_cert_chain(&settings.certificate_path)?;
    let private_key = load_private_key(&settings.key_path)?;

    let versions: &[&rustls::SupportedProtocolVersion] = match settings.min_version.as_str() {
        "1.3" => &[&rustls::version::TLS13],
        _ => &[&rustls::version::TLS12, &rustls::version::TLS13],
    };

    let config = rustls::ServerConfig::builder_with_protocol_versions(versions)
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;
    Ok(config)
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let pem_data = std::fs::read(path)?;
    let blocks = pem_parse_many(&pem_data)
        .map_err(|e| ServerError::TlsMaterial(format!("{}: {e}", path.display())))?;

    let chain: Vec<CertificateDer<'static>> = blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| CertificateDer::from(b.into_contents()))
        .collect();

    if chain.is_empty() {
        return Err(ServerError::TlsMaterial(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let pem_data = std::fs::read(path)?;
    let blocks = pem_parse_many(&pem_data)
        .map_err(|e| ServerError::TlsMaterial(format!("{}: {e}", path.display())))?;

    for block in blocks {
        let key = match block.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents())),
            "RSA PRIVATE KEY" => {
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.into_contents()))
            }
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.into_contents())),
            _ => continue,
        };
        return Ok(key);
    }

    Err(ServerError::TlsMaterial(format!(
        "{}: no private key found",
        path.display()
    )))
}

/// A session's transport: plaintext TCP or server-side TLS.
pub enum SessionStream {
    Plain(TcpStream),
    /// Boxed to keep the enum small.
    Tls(Box<TlsStream<TcpStream>>),
}

impl SessionStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
