//! Frontend/backend rendezvous for TLS and application protocol decisions.

use crate::error::{Error, Result};
use crate::negotiation::promise::Promise;
use crate::protocol::Protocol;

/// Single-assignment state shared by both pipelines of a connection.
///
/// `tls_enabled` is set by the frontend after sniffing, `client_protocols` by
/// the frontend after reading the ClientHello, and `negotiated` by whichever
/// side learns the application protocol first (the backend after its own ALPN
/// exchange, or immediately when TLS is off).
pub struct NegotiationCoordinator {
    tls_enabled: Promise<bool>,
    client_protocols: Promise<Vec<Vec<u8>>>,
    negotiated: Promise<Protocol>,
}

impl Default for NegotiationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationCoordinator {
    pub fn new() -> Self {
        Self {
            tls_enabled: Promise::new("tls_enabled"),
            client_protocols: Promise::new("client_protocols"),
            negotiated: Promise::new("negotiated_protocol"),
        }
    }

    /// Record whether the client speaks TLS.
    ///
    /// Disabling TLS settles the client protocol list as empty and resolves the
    /// negotiated protocol to `forward`, unless something already decided it.
    pub fn offer_tls(&self, enabled: bool) -> Result<()> {
        self.tls_enabled.fulfill(enabled)?;
        if !enabled {
            self.client_protocols.try_fulfill(Vec::new());
            if self.negotiated.try_fulfill(Protocol::Forward) {
                tracing::trace!("TLS disabled, protocol defaults to forward");
            }
        }
        Ok(())
    }

    /// Record the ALPN list from the client's ClientHello, in offer order.
    pub fn offer_client_protocols(&self, protocols: Vec<Vec<u8>>) -> Result<()> {
        self.client_protocols.fulfill(protocols)
    }

    /// Resolve the application protocol for the pair.
    pub fn resolve_protocol(&self, protocol: Protocol) -> Result<()> {
        if !self.tls_enabled.is_done() {
            return Err(Error::OutOfOrder(self.negotiated.name()));
        }
        self.negotiated.fulfill(protocol)
    }

    /// Fail TLS detection; the negotiated protocol fails with it.
    pub fn fail_tls(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.tls_enabled.fail(reason.clone())?;
        self.client_protocols.try_fail(reason.clone());
        self.negotiated.try_fail(reason);
        Ok(())
    }

    /// Fail the client protocol list; the negotiated protocol fails with it.
    pub fn fail_client_protocols(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.client_protocols.fail(reason.clone())?;
        self.negotiated.try_fail(reason);
        Ok(())
    }

    /// Fail every promise that is still pending. Used when the connection closes.
    pub fn fail(&self, reason: &str) {
        self.tls_enabled.try_fail(reason);
        self.client_protocols.try_fail(reason);
        self.negotiated.try_fail(reason);
    }

    pub async fn tls_enabled(&self) -> Result<bool> {
        self.tls_enabled.wait().await
    }

    pub async fn client_protocols(&self) -> Result<Vec<Vec<u8>>> {
        self.client_protocols.wait().await
    }

    pub async fn protocol(&self) -> Result<Protocol> {
        self.negotiated.wait().await
    }

    /// Register a continuation for the negotiated protocol. Never blocks.
    pub fn await_protocol<F>(&self, continuation: F)
    where
        F: FnOnce(Result<Protocol>) + Send + 'static,
    {
        self.negotiated.on_complete(continuation);
    }

    pub fn is_resolved(&self) -> bool {
        self.negotiated.is_done()
    }

    /// The negotiated protocol, if it has been decided successfully.
    pub fn negotiated_now(&self) -> Option<Protocol> {
        self.negotiated.peek().and_then(|r| r.ok())
    }
}
