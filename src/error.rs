use thiserror::Error;

/// Errors that can abort server startup or an accept loop.
///
/// Protocol-level refusals are not errors; they are rendered as `-ERR`
/// replies and the session continues. This type covers the faults that
/// have no meaningful wire expression.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid TLS material: {0}")]
    TlsMaterial(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
