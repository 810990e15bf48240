//! Outbound connections to the real server.

use std::io;
use tokio::net::TcpStream;

use super::context::Address;
use crate::protocol::{BoxFuture, BoxedIo};

/// Establishes the backend transport for a server address.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, io::Result<BoxedIo>>;
}

/// Plain TCP connector.
///
/// The overrides redirect the TCP connection only; TLS still uses the
/// original host name for SNI and certificate checks.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector {
    host_override: Option<String>,
    port_override: Option<u16>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every backend to this port (for testing).
    pub fn with_port_override(mut self, port: u16) -> Self {
        self.port_override = Some(port);
        self
    }

    /// Connect every backend to this host (for testing with unresolvable names).
    pub fn with_host_override(mut self, host: String) -> Self {
        self.host_override = Some(host);
        self
    }

    fn target(&self, address: &Address) -> (String, u16) {
        (
            self.host_override
                .clone()
                .unwrap_or_else(|| address.host.clone()),
            self.port_override.unwrap_or(address.port),
        )
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, io::Result<BoxedIo>> {
        Box::pin(async move {
            let (host, port) = self.target(address);
            tracing::debug!(server = %address, host = %host, port, "Connecting to server");
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsplice_test_support::test_report;

    #[test]
    fn test_overrides_apply_to_target() {
        let t = test_report!("Host and port overrides redirect the TCP target");
        let address = Address::new("example.com", 443);

        let plain = TcpConnector::new();
        t.assert_eq(
            "no override",
            &plain.target(&address),
            &("example.com".to_string(), 443u16),
        );

        let redirected = TcpConnector::new()
            .with_host_override("127.0.0.1".to_string())
            .with_port_override(8443);
        t.assert_eq(
            "both overridden",
            &redirected.target(&address),
            &("127.0.0.1".to_string(), 8443u16),
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_an_error() {
        let t = test_report!("Refused connection surfaces as io error");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpConnector::new()
            .connect(&Address::new("127.0.0.1", port))
            .await;
        t.assert_true("connect failed", result.is_err());
    }
}
