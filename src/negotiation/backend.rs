//! Server-side negotiation: connect, handshake, resolve protocol, install.

use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

use super::context::{Address, ConnectionContext};
use crate::error::{Error, Result};
use crate::protocol::{BoxedIo, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStage {
    Connecting,
    AwaitingTls,
    Handshaking,
    AwaitingProtocol,
    ProtocolInstalled,
    Terminal,
}

struct BackendPipeline {
    ctx: Arc<ConnectionContext>,
    stage: BackendStage,
}

/// Run the server side of a connection to completion.
///
/// Started by [`ConnectionContext::connect`]. Closes the pair when it returns.
pub async fn run(ctx: Arc<ConnectionContext>) -> Result<()> {
    let mut pipeline = BackendPipeline {
        ctx: ctx.clone(),
        stage: BackendStage::Connecting,
    };
    let result = pipeline.drive().await;
    let reached = pipeline.stage;
    pipeline.enter(BackendStage::Terminal);

    match &result {
        Ok(()) => ctx.close("server side finished"),
        Err(e) => {
            if e.is_disconnect() {
                tracing::debug!(stage = ?reached, error = %e, "Server side closed");
            } else {
                tracing::warn!(stage = ?reached, error = %e, "Server side failed");
            }
            ctx.close(&e.to_string());
        }
    }
    result
}

impl BackendPipeline {
    fn enter(&mut self, next: BackendStage) {
        tracing::trace!(from = ?self.stage, to = ?next, "Backend stage");
        self.stage = next;
    }

    async fn drive(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        let address = ctx.server_address().lock();
        if ctx.services().is_proxy_address(&address) {
            return Err(Error::negotiation(format!(
                "Refusing to connect to the proxy's own address {}",
                address
            )));
        }

        let io = tokio::select! {
            connected = ctx.services().connector.connect(&address) => {
                connected.map_err(|e| Error::upstream_connect(&address, e))?
            }
            _ = ctx.closed() => return Err(Error::ChannelClosed),
        };
        tracing::debug!(server = %address, "Connected to server");

        self.enter(BackendStage::AwaitingTls);
        let (io, protocol) = if ctx.coordinator().tls_enabled().await? {
            self.enter(BackendStage::Handshaking);
            self.handshake(io, &address).await?
        } else {
            self.enter(BackendStage::AwaitingProtocol);
            (io, ctx.coordinator().protocol().await?)
        };

        let handler = ctx.services().handlers.backend_handler(protocol)?;
        let inbox = ctx.server().install()?;
        self.enter(BackendStage::ProtocolInstalled);
        handler.run(io, ctx.clone(), inbox).await
    }

    /// Handshake with the server offering the client's ALPN list, and resolve
    /// the pair's protocol from the server's choice.
    async fn handshake(&mut self, io: BoxedIo, address: &Address) -> Result<(BoxedIo, Protocol)> {
        let ctx = self.ctx.clone();
        let offered = ctx.coordinator().client_protocols().await?;

        let mut config = (*ctx.services().upstream_tls).clone();
        config.alpn_protocols = offered;
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(address.host.clone()).map_err(|e| {
            Error::negotiation(format!("Invalid server name '{}': {}", address.host, e))
        })?;

        let stream = tokio::select! {
            handshake = connector.connect(server_name, io) => handshake.map_err(|e| {
                Error::negotiation(format!("Server handshake with {} failed: {}", address, e))
            })?,
            _ = ctx.closed() => return Err(Error::ChannelClosed),
        };

        let selected = match stream.get_ref().1.alpn_protocol() {
            None => Protocol::Forward,
            Some(id) => Protocol::from_alpn(id)?,
        };
        tracing::debug!(server = %address, protocol = %selected, "Server handshake complete");

        self.enter(BackendStage::AwaitingProtocol);
        match ctx.coordinator().resolve_protocol(selected) {
            Ok(()) | Err(Error::AlreadyResolved(_)) => {}
            Err(e) => return Err(e),
        }
        let agreed = ctx.coordinator().protocol().await?;
        if agreed != selected {
            return Err(Error::negotiation(format!(
                "server selected {} but {} was already agreed",
                selected, agreed
            )));
        }
        Ok((Box::new(stream), agreed))
    }
}
