//! Per connection-pair state.

use rustls::ClientConfig;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

use super::backend;
use super::channel::Channel;
use super::connector::Connector;
use super::coordinator::NegotiationCoordinator;
use crate::config::{Http2Config, ProxyMode};
use crate::error::{Error, Result};
use crate::listener::InterceptionListener;
use crate::protocol::HandlerProvider;
use crate::tls::CertificateProvider;

/// Host and port of the real server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` (IPv6 hosts in brackets); `default_port` applies
    /// when the port is missing.
    pub fn parse(authority: &str, default_port: u16) -> Result<Self> {
        let authority: http::uri::Authority = authority
            .parse()
            .map_err(|e| Error::proxy(format!("Invalid authority '{}': {}", authority, e)))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(Error::proxy("Authority has no host"));
        }
        Ok(Self::new(host, authority.port_u16().unwrap_or(default_port)))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

enum AddressState {
    Original(Address),
    Rewritten(Address),
    Locked(Address),
}

/// Server address: may be rewritten once, and only until the backend connects.
pub struct ServerAddress {
    state: Mutex<AddressState>,
}

impl ServerAddress {
    pub fn new(address: Address) -> Self {
        Self {
            state: Mutex::new(AddressState::Original(address)),
        }
    }

    pub fn get(&self) -> Address {
        match &*self.state.lock().unwrap() {
            AddressState::Original(a) | AddressState::Rewritten(a) | AddressState::Locked(a) => {
                a.clone()
            }
        }
    }

    pub fn rewrite(&self, address: Address) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            AddressState::Original(_) => {
                *state = AddressState::Rewritten(address);
                Ok(())
            }
            AddressState::Rewritten(_) => Err(Error::AlreadyResolved("server_address")),
            AddressState::Locked(_) => Err(Error::AddressLocked),
        }
    }

    /// Freeze the address for connecting and return it.
    pub fn lock(&self) -> Address {
        let mut state = self.state.lock().unwrap();
        let address = match &*state {
            AddressState::Original(a) | AddressState::Rewritten(a) | AddressState::Locked(a) => {
                a.clone()
            }
        };
        *state = AddressState::Locked(address.clone());
        address
    }

    pub fn is_locked(&self) -> bool {
        matches!(*self.state.lock().unwrap(), AddressState::Locked(_))
    }
}

/// Collaborators shared by every connection the proxy serves.
pub struct Services {
    pub mode: ProxyMode,
    pub certificates: Arc<dyn CertificateProvider>,
    pub connector: Arc<dyn Connector>,
    pub handlers: Arc<dyn HandlerProvider>,
    pub listener: Arc<dyn InterceptionListener>,
    /// Base client config for server handshakes; ALPN is replaced per connection.
    pub upstream_tls: Arc<ClientConfig>,
    pub http2: Http2Config,
    pub sniff_timeout: Duration,
    /// Where the proxy accepts connections, once bound.
    pub listen_addr: Option<SocketAddr>,
}

impl Services {
    /// True when connecting to `address` would reach this proxy again.
    ///
    /// Transparent mode reads the target from the accepted socket, so a
    /// client that connects to the proxy directly (or traffic redirected
    /// with REDIRECT rather than TPROXY) names the listener itself.
    pub fn is_proxy_address(&self, address: &Address) -> bool {
        let Some(listen) = self.listen_addr else {
            return false;
        };
        let Ok(ip) = address.host.parse::<IpAddr>() else {
            return false;
        };
        if address.port != listen.port() {
            return false;
        }
        if ip == listen.ip() {
            return true;
        }
        listen.ip().is_unspecified()
            && (self.mode == ProxyMode::Transparent || ip.is_loopback() || ip.is_unspecified())
    }
}

/// State of one client connection and its backend counterpart.
pub struct ConnectionContext {
    id: u64,
    client_addr: SocketAddr,
    server_addr: ServerAddress,
    coordinator: NegotiationCoordinator,
    client: Channel,
    server: Channel,
    services: Arc<Services>,
    backend_started: AtomicBool,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("client", &self.client_addr)
            .field("server", &self.server_addr.get())
            .field("protocol", &self.coordinator.negotiated_now())
            .finish()
    }
}

impl ConnectionContext {
    pub fn new(
        id: u64,
        client_addr: SocketAddr,
        server_addr: Address,
        services: Arc<Services>,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            client_addr,
            server_addr: ServerAddress::new(server_addr),
            coordinator: NegotiationCoordinator::new(),
            client: Channel::new("client"),
            server: Channel::new("server"),
            services,
            backend_started: AtomicBool::new(false),
            closed,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> ProxyMode {
        self.services.mode
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn server_addr(&self) -> Address {
        self.server_addr.get()
    }

    pub fn server_address(&self) -> &ServerAddress {
        &self.server_addr
    }

    pub fn coordinator(&self) -> &NegotiationCoordinator {
        &self.coordinator
    }

    /// Channel whose messages end up written to the client.
    pub fn client(&self) -> &Channel {
        &self.client
    }

    /// Channel whose messages end up written to the real server.
    pub fn server(&self) -> &Channel {
        &self.server
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Start the backend pipeline. Only the first call has an effect.
    pub fn connect(self: &Arc<Self>) {
        if self.backend_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = self.clone();
        tokio::spawn(backend::run(ctx).instrument(tracing::Span::current()));
    }

    pub fn backend_started(&self) -> bool {
        self.backend_started.load(Ordering::SeqCst)
    }

    /// Tear the pair down: fail pending negotiation, release queued writes,
    /// and end both handlers' inboxes. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.closed.send_replace(true) {
            return;
        }
        self.coordinator.fail(reason);
        let released = self.client.close() + self.server.close();
        tracing::debug!(reason, released, "Connection closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
