//! Application protocols and the handlers spliced in once one is negotiated.
//!
//! After negotiation each side of a connection runs one [`ProtocolHandler`].
//! The two handlers never share I/O; they talk through the peer's
//! [`Channel`](crate::negotiation::Channel) using [`Message`]s.

mod forward;
pub mod http1;
pub mod http2;

use bytes::Bytes;
use http::{Request, Response};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::negotiation::{ConnectionContext, Inbox};
use http2::{FlowRelease, Http2Frame};

pub use forward::ForwardHandler;
pub use http1::{Http1Backend, Http1Frontend};
pub use http2::{Http2Backend, Http2Frontend};

/// How long a side keeps flushing already-produced responses after its peer
/// has gone.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Any bidirectional byte stream a handler can own.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Application protocol selected for a connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Opaque byte relay.
    Forward,
    Http1,
    Http2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Forward => "forward",
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }

    /// ALPN identifier to present for this protocol. `Forward` presents none.
    pub fn alpn_id(&self) -> Option<&'static [u8]> {
        match self {
            Protocol::Forward => None,
            Protocol::Http1 => Some(b"http/1.1"),
            Protocol::Http2 => Some(b"h2"),
        }
    }

    /// Map the protocol a server selected via ALPN.
    pub fn from_alpn(id: &[u8]) -> Result<Self> {
        match id {
            b"http/1.1" => Ok(Protocol::Http1),
            b"h2" => Ok(Protocol::Http2),
            other => Err(Error::unsupported_protocol(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" => Ok(Protocol::Forward),
            other => Protocol::from_alpn(other.as_bytes()),
        }
    }
}

/// One HTTP/1.1 request travelling to the backend, with the slot its
/// response goes back through.
pub struct Exchange {
    pub request: Request<Bytes>,
    pub reply: oneshot::Sender<Result<Response<Bytes>>>,
}

/// Unit of data passed from one side of a connection to the other.
pub enum Message {
    Bytes(Bytes),
    /// The sending side will not produce more bytes.
    Eof,
    /// DATA frames received from a peer carry the flow-control credit to
    /// hand back once the frame has been written out.
    Frame(Http2Frame, Option<FlowRelease>),
    Exchange(Exchange),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Bytes(_) => "bytes",
            Message::Eof => "eof",
            Message::Frame(..) => "h2-frame",
            Message::Exchange(_) => "http1-exchange",
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Message::Eof => f.write_str("Eof"),
            Message::Frame(frame, _) => write!(f, "Frame({:?})", frame),
            Message::Exchange(ex) => write!(
                f,
                "Exchange({} {})",
                ex.request.method(),
                ex.request.uri()
            ),
        }
    }
}

/// A stage installed on one side of a connection once its protocol is known.
pub trait ProtocolHandler: Send {
    /// Drive the side until it finishes. `inbox` yields what the peer side sent.
    fn run(
        self: Box<Self>,
        io: BoxedIo,
        ctx: Arc<ConnectionContext>,
        inbox: Inbox,
    ) -> BoxFuture<'static, Result<()>>;
}

/// Factory for the per-side protocol handlers.
pub trait HandlerProvider: Send + Sync {
    fn frontend_handler(&self, protocol: Protocol) -> Result<Box<dyn ProtocolHandler>>;
    fn backend_handler(&self, protocol: Protocol) -> Result<Box<dyn ProtocolHandler>>;
}

/// Handlers for `forward`, `http/1.1` and `h2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandlerProvider;

impl HandlerProvider for DefaultHandlerProvider {
    fn frontend_handler(&self, protocol: Protocol) -> Result<Box<dyn ProtocolHandler>> {
        Ok(match protocol {
            Protocol::Forward => Box::new(ForwardHandler::client_side()),
            Protocol::Http1 => Box::new(Http1Frontend),
            Protocol::Http2 => Box::new(Http2Frontend),
        })
    }

    fn backend_handler(&self, protocol: Protocol) -> Result<Box<dyn ProtocolHandler>> {
        Ok(match protocol {
            Protocol::Forward => Box::new(ForwardHandler::server_side()),
            Protocol::Http1 => Box::new(Http1Backend),
            Protocol::Http2 => Box::new(Http2Backend),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsplice_test_support::test_report;

    #[test]
    fn test_protocol_names() {
        let t = test_report!("Protocol names round through FromStr");
        for p in [Protocol::Forward, Protocol::Http1, Protocol::Http2] {
            let parsed: Protocol = p.as_str().parse().unwrap();
            t.assert_eq(p.as_str(), &parsed, &p);
        }
    }

    #[test]
    fn test_unknown_alpn_is_unsupported() {
        let t = test_report!("Unknown ALPN selection is an unsupported protocol");
        let err = Protocol::from_alpn(b"spdy/3.1").unwrap_err();
        t.assert_true(
            "UnsupportedProtocol",
            matches!(err, Error::UnsupportedProtocol(ref name) if name == "spdy/3.1"),
        );
    }

    #[test]
    fn test_forward_presents_no_alpn() {
        let t = test_report!("Forward presents no ALPN identifier");
        t.assert_eq("forward", &Protocol::Forward.alpn_id(), &None);
        t.assert_eq("h2", &Protocol::Http2.alpn_id(), &Some(&b"h2"[..]));
    }
}
