//! tlsplice - An intercepting TLS proxy that negotiates per connection
//!
//! Each client connection is paired with a connection to the real server.
//! The proxy terminates TLS on both sides, offers the server exactly the
//! ALPN protocols the client offered, and presents the client whatever the
//! server picked. The pair then runs as one of:
//!
//! - **forward**: opaque bytes in both directions
//! - **HTTP/1.1**: requests and responses buffered and replayed
//! - **HTTP/2**: frames correlated per stream into request/response events
//!
//! An [`InterceptionListener`] sees every exchange and may answer requests
//! itself instead of forwarding them.
//!
//! # Example
//!
//! ```no_run
//! use tlsplice::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.toml")?;
//!     let server = ProxyServer::new(config)?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(rx).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod listener;
pub mod negotiation;
pub mod protocol;
pub mod proxy;
pub mod tls;

pub use config::{Config, ProxyMode};
pub use error::{Error, Result};
pub use listener::{InterceptionListener, LoggingListener, NoopListener, RequestResponseEvent};
pub use negotiation::{Address, ConnectionContext, Connector, TcpConnector};
pub use protocol::http2::{FrameBatch, Http2Frame, Http2Headers};
pub use protocol::{HandlerProvider, Protocol};
pub use proxy::ProxyServer;
pub use tls::{CertificateAuthority, CertificateProvider, GeneratedCa, MitmCertificateGenerator};
