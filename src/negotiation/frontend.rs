//! Client-side negotiation: sniff, SNI, ALPN rendezvous, handshake, install.

use rustls::server::Acceptor;
use std::sync::Arc;
use tokio_rustls::LazyConfigAcceptor;

use super::context::{Address, ConnectionContext};
use super::sniff::{sniff, Rewind, Sniffed};
use crate::config::ProxyMode;
use crate::error::{Error, Result};
use crate::protocol::{BoxedIo, Io, Protocol};

/// Port assumed for destinations learned from SNI.
const TLS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendStage {
    Sniffing,
    TlsDetected,
    PlaintextDetected,
    SniExtracted,
    AlpnNegotiated,
    HandshakeComplete,
    ProtocolInstalled,
    Terminal,
}

struct FrontendPipeline {
    ctx: Arc<ConnectionContext>,
    stage: FrontendStage,
}

/// Run the client side of a connection to completion.
///
/// Whatever the outcome, the connection pair is closed when this returns.
pub async fn run<S>(ctx: Arc<ConnectionContext>, io: S) -> Result<()>
where
    S: Io + 'static,
{
    let mut pipeline = FrontendPipeline {
        ctx: ctx.clone(),
        stage: FrontendStage::Sniffing,
    };
    let result = pipeline.drive(io).await;
    let reached = pipeline.stage;
    pipeline.enter(FrontendStage::Terminal);

    match &result {
        Ok(()) => ctx.close("client side finished"),
        Err(e) => {
            if e.is_disconnect() {
                tracing::debug!(stage = ?reached, error = %e, "Client side closed");
            } else {
                tracing::warn!(stage = ?reached, error = %e, "Client side failed");
            }
            ctx.close(&e.to_string());
        }
    }
    result
}

impl FrontendPipeline {
    fn enter(&mut self, next: FrontendStage) {
        tracing::trace!(from = ?self.stage, to = ?next, "Frontend stage");
        self.stage = next;
    }

    async fn drive<S: Io + 'static>(&mut self, io: S) -> Result<()> {
        let ctx = self.ctx.clone();
        let (io, kind) = match sniff(io, ctx.services().sniff_timeout).await {
            Ok(sniffed) => sniffed,
            Err(e) => {
                let _ = ctx.coordinator().fail_tls(e.to_string());
                return Err(e.into());
            }
        };

        match kind {
            Sniffed::Plaintext => {
                self.enter(FrontendStage::PlaintextDetected);
                ctx.coordinator().offer_tls(false)?;
                if ctx.mode() == ProxyMode::Transparent {
                    ctx.connect();
                }
                let protocol = ctx.coordinator().protocol().await?;
                self.install(protocol, Box::new(io)).await
            }
            Sniffed::Tls => {
                self.enter(FrontendStage::TlsDetected);
                ctx.coordinator().offer_tls(true)?;
                self.terminate_tls(io).await
            }
        }
    }

    async fn terminate_tls<S: Io + 'static>(&mut self, io: Rewind<S>) -> Result<()> {
        let ctx = self.ctx.clone();

        let start = match LazyConfigAcceptor::new(Acceptor::default(), io).await {
            Ok(start) => start,
            Err(e) => {
                let _ = ctx.coordinator().fail_client_protocols(e.to_string());
                return Err(Error::negotiation(format!(
                    "Failed to read ClientHello: {}",
                    e
                )));
            }
        };

        let (sni, offered) = {
            let hello = start.client_hello();
            let offered: Vec<Vec<u8>> = hello
                .alpn()
                .map(|ids| ids.map(<[u8]>::to_vec).collect())
                .unwrap_or_default();
            (hello.server_name().map(str::to_owned), offered)
        };

        self.extract_sni(sni.as_deref())?;

        ctx.coordinator().offer_client_protocols(offered.clone())?;
        self.enter(FrontendStage::AlpnNegotiated);
        let protocol = ctx.coordinator().protocol().await?;

        // Present exactly what the server agreed to, and only if the client asked for it.
        let alpn = match protocol.alpn_id() {
            None => None,
            Some(id) if offered.iter().any(|p| p == id) => Some(id),
            Some(_) => {
                return Err(Error::negotiation(format!(
                    "client did not offer {}",
                    protocol
                )))
            }
        };

        let host = sni.unwrap_or_else(|| ctx.server_addr().host);
        let (chain, key) = ctx.services().certificates.certificate_for(&host)?;
        let config = crate::tls::server_config(chain, key, alpn)?;

        let stream = start
            .into_stream(Arc::new(config))
            .await
            .map_err(|e| Error::negotiation(format!("Client handshake failed: {}", e)))?;
        self.enter(FrontendStage::HandshakeComplete);
        tracing::debug!(host = %host, protocol = %protocol, "Client handshake complete");

        self.install(protocol, Box::new(stream)).await
    }

    fn extract_sni(&mut self, sni: Option<&str>) -> Result<()> {
        let ctx = self.ctx.clone();
        match ctx.mode() {
            ProxyMode::Transparent => {
                if let Some(host) = sni {
                    let original = ctx.server_addr();
                    ctx.server_address()
                        .rewrite(Address::new(host, TLS_PORT))?;
                    tracing::debug!(sni = host, original = %original, "Destination taken from SNI");
                }
                ctx.connect();
            }
            ProxyMode::Explicit => {
                let target = ctx.server_addr();
                if let Some(host) = sni.filter(|h| !h.eq_ignore_ascii_case(&target.host)) {
                    tracing::debug!(sni = host, target = %target, "SNI differs from CONNECT target");
                }
            }
        }
        self.enter(FrontendStage::SniExtracted);
        Ok(())
    }

    async fn install(&mut self, protocol: Protocol, io: BoxedIo) -> Result<()> {
        let handler = self.ctx.services().handlers.frontend_handler(protocol)?;
        let inbox = self.ctx.client().install()?;
        self.enter(FrontendStage::ProtocolInstalled);
        handler.run(io, self.ctx.clone(), inbox).await
    }
}
