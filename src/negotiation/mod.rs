//! Per-connection protocol negotiation.
//!
//! Every accepted connection gets a [`ConnectionContext`] and two pipelines.
//! The frontend inspects the client: plaintext or TLS, SNI, offered ALPN ids.
//! The backend connects to the server and, for TLS, offers it exactly the
//! client's ALPN list. The two meet in the [`NegotiationCoordinator`]; once
//! the protocol is known each side installs its handler and the queued
//! cross-side writes are flushed to it.

mod backend;
mod channel;
mod connector;
mod context;
mod coordinator;
mod frontend;
mod promise;
pub mod sniff;

use std::sync::Arc;

use crate::config::ProxyMode;
use crate::error::Result;
use crate::protocol::Io;

pub use backend::BackendStage;
pub use channel::{Channel, Inbox};
pub use connector::{Connector, TcpConnector};
pub use context::{Address, ConnectionContext, ServerAddress, Services};
pub use coordinator::NegotiationCoordinator;
pub use frontend::FrontendStage;
pub use promise::Promise;

/// Run a connection pair to completion from the client's stream.
///
/// In explicit mode the destination is already known, so the backend starts
/// connecting right away; in transparent mode the frontend starts it once
/// the destination is settled.
pub async fn serve_connection<S>(ctx: Arc<ConnectionContext>, io: S) -> Result<()>
where
    S: Io + 'static,
{
    if ctx.mode() == ProxyMode::Explicit {
        ctx.connect();
    }
    frontend::run(ctx, io).await
}
