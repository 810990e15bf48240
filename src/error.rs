//! Error types for tlsplice

use std::io;

/// Main error type for the proxy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    /// ALPN, SNI or handshake failure. Fatal to the connection pair.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Failed to connect to {address}: {source}")]
    UpstreamConnect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// A single-assignment value was written twice.
    #[error("{0} was already resolved")]
    AlreadyResolved(&'static str),

    #[error("{0} resolved before its prerequisite")]
    OutOfOrder(&'static str),

    #[error("Server address can no longer be rewritten (backend already connected)")]
    AddressLocked,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::Proxy(msg.into())
    }

    pub fn negotiation(msg: impl Into<String>) -> Self {
        Error::Negotiation(msg.into())
    }

    pub fn unsupported_protocol(name: impl Into<String>) -> Self {
        Error::UnsupportedProtocol(name.into())
    }

    pub fn upstream_connect(address: impl ToString, source: io::Error) -> Self {
        Error::UpstreamConnect {
            address: address.to_string(),
            source,
        }
    }

    /// True for errors that indicate a bug in the caller rather than a
    /// network or peer condition.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::AlreadyResolved(_) | Error::OutOfOrder(_) | Error::AddressLocked
        )
    }

    /// True for the routine ways a peer goes away, which are not worth
    /// logging above debug.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ChannelClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            Error::Http(e) => e.is_closed() || e.is_incomplete_message(),
            Error::Http2(e) => e.is_go_away() || e.is_io(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
