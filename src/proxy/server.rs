//! Main proxy server

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use super::handler::ProxyHandler;
use crate::config::{Config, ProxyMode};
use crate::error::{Error, Result};
use crate::listener::{InterceptionListener, LoggingListener, NoopListener};
use crate::negotiation::{self, Address, ConnectionContext, Connector, Services, TcpConnector};
use crate::protocol::{DefaultHandlerProvider, HandlerProvider};
use crate::tls::{self, CertificateAuthority, CertificateProvider, MitmCertificateGenerator};

/// The main proxy server
pub struct ProxyServer {
    config: Config,
    certificates: Arc<dyn CertificateProvider>,
    connector: Option<Arc<dyn Connector>>,
    handlers: Arc<dyn HandlerProvider>,
    listener: Arc<dyn InterceptionListener>,
    upstream_tls: Arc<ClientConfig>,
    upstream_port_override: Option<u16>,
    upstream_host_override: Option<String>,
    bound: Option<TcpListener>,
}

impl ProxyServer {
    /// Create a new proxy server from configuration
    pub fn new(config: Config) -> Result<Self> {
        let ca_cert = config
            .proxy
            .ca_cert
            .as_ref()
            .ok_or_else(|| Error::config("CA certificate path not specified"))?;
        let ca_key = config
            .proxy
            .ca_key
            .as_ref()
            .ok_or_else(|| Error::config("CA key path not specified"))?;

        let ca = CertificateAuthority::from_files(ca_cert, ca_key)?;
        let certificates: Arc<dyn CertificateProvider> = Arc::new(MitmCertificateGenerator::new(ca));

        let upstream_tls = match &config.proxy.upstream_tls_ca {
            Some(path) => tls::upstream_client_config_from_pem(path)?,
            None => tls::upstream_client_config(),
        };

        let listener: Arc<dyn InterceptionListener> = if config.logging.log_events {
            Arc::new(LoggingListener)
        } else {
            Arc::new(NoopListener)
        };

        tracing::info!(
            mode = %config.proxy.mode,
            log_events = config.logging.log_events,
            "Proxy initialized"
        );

        Ok(Self {
            upstream_port_override: config.proxy.upstream_override_port,
            config,
            certificates,
            connector: None,
            handlers: Arc::new(DefaultHandlerProvider),
            listener,
            upstream_tls,
            upstream_host_override: None,
            bound: None,
        })
    }

    /// Override the upstream port for all backend connections (for testing).
    pub fn with_upstream_port_override(mut self, port: u16) -> Self {
        self.upstream_port_override = Some(port);
        self
    }

    /// Override the upstream host for TCP connections (for testing with non-resolvable hostnames).
    /// The original hostname is still used for TLS SNI.
    pub fn with_upstream_host_override(mut self, host: String) -> Self {
        self.upstream_host_override = Some(host);
        self
    }

    /// Inject the base TLS config for server handshakes (for testing with self-signed certs).
    /// Its ALPN list is replaced by each client's offer.
    pub fn with_upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls = config;
        self
    }

    /// Replace the interception listener.
    pub fn with_listener(mut self, listener: Arc<dyn InterceptionListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Replace the backend connector. Host and port overrides no longer apply.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_handlers(mut self, handlers: Arc<dyn HandlerProvider>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let local_addr = self.bind().await?;
        tracing::info!(address = %local_addr, mode = %self.config.proxy.mode, "Proxy server listening");
        self.serve(shutdown).await
    }

    /// Bind the configured address and return the local address.
    ///
    /// Useful when binding to port 0 to discover the assigned port.
    /// Call `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = self.config.bind_addr()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))?;

        self.bound = Some(listener);
        Ok(local_addr)
    }

    /// Serve connections on the bound listener until `shutdown` fires.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let listener = self
            .bound
            .take()
            .ok_or_else(|| Error::proxy("bind() must be called before serve()"))?;
        let services = self.services(listener.local_addr().ok());
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    next_id += 1;
                    tracing::debug!(id = next_id, client = %client_addr, "New connection");
                    spawn_connection(next_id, stream, client_addr, services.clone());
                }
            }
        }
    }

    fn services(&self, listen_addr: Option<SocketAddr>) -> Arc<Services> {
        let connector = self.connector.clone().unwrap_or_else(|| {
            let mut tcp = TcpConnector::new();
            if let Some(port) = self.upstream_port_override {
                tcp = tcp.with_port_override(port);
            }
            if let Some(ref host) = self.upstream_host_override {
                tcp = tcp.with_host_override(host.clone());
            }
            Arc::new(tcp)
        });

        Arc::new(Services {
            mode: self.config.proxy.mode,
            certificates: self.certificates.clone(),
            connector,
            handlers: self.handlers.clone(),
            listener: self.listener.clone(),
            upstream_tls: self.upstream_tls.clone(),
            http2: self.config.http2,
            sniff_timeout: self.config.proxy.sniff_timeout(),
            listen_addr,
        })
    }

    /// Get the bind address
    pub fn bind_address(&self) -> &str {
        &self.config.proxy.bind_address
    }

    pub fn mode(&self) -> ProxyMode {
        self.config.proxy.mode
    }
}

/// Spawn a task to handle a single accepted connection.
fn spawn_connection(id: u64, stream: TcpStream, client_addr: SocketAddr, services: Arc<Services>) {
    let span = tracing::info_span!("conn", id, client = %client_addr, mode = %services.mode);

    tokio::spawn(
        async move {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }
            match services.mode {
                ProxyMode::Explicit => serve_explicit(id, stream, client_addr, services).await,
                ProxyMode::Transparent => serve_transparent(id, stream, client_addr, services).await,
            }
        }
        .instrument(span),
    );
}

/// Explicit mode: the client speaks HTTP/1.1 proxy protocol first.
async fn serve_explicit(id: u64, stream: TcpStream, client_addr: SocketAddr, services: Arc<Services>) {
    let service = service_fn(move |req| {
        let handler = ProxyHandler::new(id, client_addr, services.clone());
        async move { handler.handle(req).await }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        if !e.is_closed() && !e.is_incomplete_message() {
            tracing::debug!(error = %e, "Connection error");
        }
    }
}

/// Transparent mode: the accepted socket's local address is where the client
/// meant to go; SNI may refine the host later.
async fn serve_transparent(
    id: u64,
    stream: TcpStream,
    client_addr: SocketAddr,
    services: Arc<Services>,
) {
    let original = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read original destination");
            return;
        }
    };

    let ctx = ConnectionContext::new(id, client_addr, Address::from(original), services);
    // Failures are logged by the pipelines themselves.
    let _ = negotiation::serve_connection(ctx, stream).await;
}
