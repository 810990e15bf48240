//! Test infrastructure for end-to-end proxy tests.
#![allow(dead_code)]

use bytes::Bytes;
use http::HeaderMap;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Frame};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::TempDir;
use tlsplice::negotiation::Address;
use tlsplice::protocol::{BoxFuture, BoxedIo};
use tlsplice::tls::{CertificateAuthority, GeneratedCa};
use tlsplice::{
    Config, Connector, FrameBatch, Http2Frame, InterceptionListener, ProxyMode, ProxyServer,
    RequestResponseEvent,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

// ---------------------------------------------------------------------------
// TestCa
// ---------------------------------------------------------------------------

/// A test CA saved to a tempdir; signs both the upstream certs and the
/// proxy's per-host certs.
pub struct TestCa {
    pub ca: CertificateAuthority,
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub dir: TempDir,
    pub cert_path: String,
    pub key_path: String,
}

impl TestCa {
    pub fn generate() -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let generated = GeneratedCa::generate().unwrap();
        let ca = CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem).unwrap();
        let cert_der = ca.cert_der().clone();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        generated.save(&cert_path, &key_path).unwrap();

        Self {
            ca,
            cert_pem: generated.cert_pem,
            cert_der,
            cert_path: cert_path.to_str().unwrap().to_string(),
            key_path: key_path.to_str().unwrap().to_string(),
            dir,
        }
    }

    /// Server config for `hostname` advertising `alpn`.
    pub fn server_tls_config(&self, hostname: &str, alpn: &[&[u8]]) -> Arc<ServerConfig> {
        let (cert, key) = self.ca.issue(hostname).unwrap();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert, self.cert_der.clone()], key)
            .unwrap();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }
}

// ---------------------------------------------------------------------------
// TestUpstream - a tiny HTTPS (or plain HTTP) server
// ---------------------------------------------------------------------------

pub type UpstreamHandler =
    Arc<dyn Fn(Request<Incoming>) -> UpstreamResponse + Send + Sync + 'static>;

pub type UpstreamResponse = std::pin::Pin<
    Box<
        dyn std::future::Future<
                Output = std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>,
            > + Send,
    >,
>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Transport {
    Tls { h2: bool },
    Plain,
}

/// A test upstream server counting the requests it serves.
pub struct TestUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestUpstream {
    /// HTTPS upstream for `localhost` speaking h2 and HTTP/1.1.
    pub async fn start(ca: &TestCa, handler: UpstreamHandler) -> Self {
        let config = ca.server_tls_config("localhost", &[b"h2", b"http/1.1"]);
        Self::start_with(Some(config), Transport::Tls { h2: true }, handler).await
    }

    /// HTTPS upstream for `localhost` that only speaks HTTP/1.1.
    pub async fn start_h1_only(ca: &TestCa, handler: UpstreamHandler) -> Self {
        let config = ca.server_tls_config("localhost", &[b"http/1.1"]);
        Self::start_with(Some(config), Transport::Tls { h2: false }, handler).await
    }

    /// Plain HTTP/1.1 upstream.
    pub async fn start_plain(handler: UpstreamHandler) -> Self {
        Self::start_with(None, Transport::Plain, handler).await
    }

    async fn start_with(
        server_config: Option<Arc<ServerConfig>>,
        transport: Transport,
        handler: UpstreamHandler,
    ) -> Self {
        let acceptor = server_config.map(TlsAcceptor::from);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let (stream, _) = match result {
                            Ok(conn) => conn,
                            Err(_) => continue,
                        };

                        let acceptor = acceptor.clone();
                        let handler = handler.clone();
                        let counter = counter.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                handler(req)
                            });

                            match (transport, acceptor) {
                                (Transport::Tls { h2 }, Some(acceptor)) => {
                                    let Ok(tls) = acceptor.accept(stream).await else {
                                        return;
                                    };
                                    let io = TokioIo::new(tls);
                                    if h2 {
                                        let _ = auto::Builder::new(TokioExecutor::new())
                                            .serve_connection(io, service)
                                            .await;
                                    } else {
                                        let _ = http1::Builder::new().serve_connection(io, service).await;
                                    }
                                }
                                _ => {
                                    let _ = http1::Builder::new()
                                        .serve_connection(TokioIo::new(stream), service)
                                        .await;
                                }
                            }
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Requests that reached this upstream.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn text_response(body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .unwrap()
}

/// Returns 200 with a fixed text body.
pub fn ok_handler(body: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| Box::pin(async move { Ok(text_response(body.to_string())) }))
}

/// Echoes the protocol version, method, path and request body length.
pub fn echo_handler() -> UpstreamHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let version = format!("{:?}", req.version());
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let host = req
                .headers()
                .get(hyper::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
                .or_else(|| req.uri().authority().map(|a| a.to_string()))
                .unwrap_or_default();
            let body = req.into_body().collect().await?.to_bytes();

            Ok(text_response(format!(
                "version={}\nmethod={}\npath={}\nhost={}\nbody_len={}\n",
                version,
                method,
                path,
                host,
                body.len()
            )))
        })
    })
}

/// Returns `size` bytes of body.
pub fn sized_handler(size: usize) -> UpstreamHandler {
    Arc::new(move |_req| Box::pin(async move { Ok(text_response("z".repeat(size))) }))
}

/// Returns 200 and asks the client to close the connection afterwards.
pub fn closing_handler(body: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            let mut response = text_response(body.to_string());
            response
                .headers_mut()
                .insert(hyper::header::CONNECTION, "close".parse().unwrap());
            Ok(response)
        })
    })
}

/// Sends the first chunk of a body and then nothing, never ending it.
pub fn stalled_handler(first: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            let body = Stalled {
                first: Some(Bytes::from_static(first.as_bytes())),
            };
            Ok(Response::new(body.boxed()))
        })
    })
}

struct Stalled {
    first: Option<Bytes>,
}

impl Body for Stalled {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        match self.first.take() {
            Some(chunk) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            None => Poll::Pending,
        }
    }
}

/// Streams `size` bytes in 16 KiB chunks, counting in `produced` how much the
/// server has been allowed to send so far.
pub fn counting_handler(size: usize, produced: Arc<AtomicUsize>) -> UpstreamHandler {
    Arc::new(move |_req| {
        let produced = produced.clone();
        Box::pin(async move {
            let body = Counting {
                remaining: size,
                produced,
            };
            Ok(Response::new(body.boxed()))
        })
    })
}

struct Counting {
    remaining: usize,
    produced: Arc<AtomicUsize>,
}

impl Body for Counting {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        if self.remaining == 0 {
            return Poll::Ready(None);
        }
        let len = self.remaining.min(16 * 1024);
        self.remaining -= len;
        self.produced.fetch_add(len, Ordering::SeqCst);
        Poll::Ready(Some(Ok(Frame::data(Bytes::from(vec![b'c'; len])))))
    }
}

// ---------------------------------------------------------------------------
// RawUpstream - h2 servers that misbehave at the connection level
// ---------------------------------------------------------------------------

/// An HTTPS upstream on `localhost` that negotiates h2 and then does
/// something a regular server would not.
pub struct RawUpstream {
    pub addr: SocketAddr,
}

impl RawUpstream {
    /// Answers the first request with `body`, then sends GOAWAY and closes
    /// the connection as soon as the response is out.
    pub async fn goaway_after_response(ca: &TestCa, body: &'static str) -> Self {
        Self::start(ca, move |tls| {
            Box::pin(async move {
                let Ok(mut conn) = h2::server::handshake(tls).await else {
                    return;
                };
                let Some(Ok((_request, mut respond))) = conn.accept().await else {
                    return;
                };
                let response = Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/plain")
                    .body(())
                    .unwrap();
                let Ok(mut send) = respond.send_response(response, false) else {
                    return;
                };
                let _ = send.send_data(Bytes::from_static(body.as_bytes()), true);
                conn.graceful_shutdown();
                while let Some(Ok(_)) = conn.accept().await {}
            })
        })
        .await
    }

    /// Completes TLS with ALPN h2, then writes bytes that are not an h2
    /// preface reply and hangs up.
    pub async fn broken_h2(ca: &TestCa) -> Self {
        Self::start(ca, |mut tls| {
            Box::pin(async move {
                let _ = tls.write_all(b"this is not an HTTP/2 server\r\n").await;
                let _ = tls.shutdown().await;
            })
        })
        .await
    }

    async fn start<F>(ca: &TestCa, serve: F) -> Self
    where
        F: Fn(tokio_rustls::server::TlsStream<TcpStream>) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let acceptor = TlsAcceptor::from(ca.server_tls_config("localhost", &[b"h2"]));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve = Arc::new(serve);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let serve = serve.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(stream).await {
                        (*serve)(tls).await;
                    }
                });
            }
        });
        Self { addr }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

// ---------------------------------------------------------------------------
// RecordingListener
// ---------------------------------------------------------------------------

/// Records events and response frames; optionally answers one path itself.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RequestResponseEvent>>,
    response_frames: AtomicUsize,
    response_data: AtomicUsize,
    substitute_path: Option<String>,
}

pub const SUBSTITUTE_BODY: &str = "answered by the proxy";

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests for `path` get a 418 from the listener instead of the server.
    pub fn substituting(path: &str) -> Arc<Self> {
        Arc::new(Self {
            substitute_path: Some(path.to_string()),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<RequestResponseEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn response_frames(&self) -> usize {
        self.response_frames.load(Ordering::SeqCst)
    }

    /// HTTP/1.1 response body bytes seen chunk by chunk.
    pub fn response_data(&self) -> usize {
        self.response_data.load(Ordering::SeqCst)
    }

    /// Events are emitted once the response has ended, which may be just
    /// after the client has read it.
    pub async fn wait_for_events(&self, count: usize) -> Vec<RequestResponseEvent> {
        for _ in 0..100 {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.events()
    }

    fn substitute_headers() -> HeaderMap {
        let mut fields = HeaderMap::new();
        fields.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());
        fields
    }
}

impl InterceptionListener for RecordingListener {
    fn on_http2_request(&self, request: &FrameBatch) -> Option<FrameBatch> {
        let path = request.headers()?.path.as_deref()?;
        if Some(path) != self.substitute_path.as_deref() {
            return None;
        }
        Some(FrameBatch::response(
            StatusCode::IM_A_TEAPOT,
            Self::substitute_headers(),
            Bytes::from_static(SUBSTITUTE_BODY.as_bytes()),
        ))
    }

    fn on_http2_response_frame(&self, _frame: &Http2Frame) {
        self.response_frames.fetch_add(1, Ordering::SeqCst);
    }

    fn on_http1_request(&self, request: &Request<Bytes>) -> Option<Response<Bytes>> {
        if Some(request.uri().path()) != self.substitute_path.as_deref() {
            return None;
        }
        let mut response = Response::new(Bytes::from_static(SUBSTITUTE_BODY.as_bytes()));
        *response.status_mut() = StatusCode::IM_A_TEAPOT;
        *response.headers_mut() = Self::substitute_headers();
        Some(response)
    }

    fn on_http1_response_data(&self, data: &Bytes) {
        self.response_data.fetch_add(data.len(), Ordering::SeqCst);
    }

    fn on_http_event(&self, event: &RequestResponseEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// FixedPortConnector - records targets, connects to one local port
// ---------------------------------------------------------------------------

pub struct FixedPortConnector {
    port: u16,
    addresses: Mutex<Vec<Address>>,
}

impl FixedPortConnector {
    pub fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            addresses: Mutex::new(Vec::new()),
        })
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.addresses.lock().unwrap().clone()
    }
}

impl Connector for FixedPortConnector {
    fn connect<'a>(&'a self, address: &'a Address) -> BoxFuture<'a, io::Result<BoxedIo>> {
        self.addresses.lock().unwrap().push(address.clone());
        Box::pin(async move {
            let stream = TcpStream::connect(("127.0.0.1", self.port)).await?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}

// ---------------------------------------------------------------------------
// TestProxy - wraps ProxyServer with bind + spawn
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    /// Explicit-mode proxy sending every backend connection to `upstream_port`.
    pub async fn start(ca: &TestCa, upstream_port: u16) -> Self {
        Self::launch(ca, ProxyMode::Explicit, |server| {
            server.with_upstream_port_override(upstream_port)
        })
        .await
    }

    pub async fn with_listener(
        ca: &TestCa,
        upstream_port: u16,
        listener: Arc<dyn InterceptionListener>,
    ) -> Self {
        Self::launch(ca, ProxyMode::Explicit, |server| {
            server
                .with_upstream_port_override(upstream_port)
                .with_listener(listener)
        })
        .await
    }

    /// Start a proxy trusting the test CA upstream; `configure` adjusts the
    /// server before it binds.
    pub async fn launch(
        ca: &TestCa,
        mode: ProxyMode,
        configure: impl FnOnce(ProxyServer) -> ProxyServer,
    ) -> Self {
        let mut config = Config::minimal(
            "127.0.0.1:0".to_string(),
            ca.cert_path.clone(),
            ca.key_path.clone(),
        );
        config.proxy.mode = mode;
        config.logging.log_events = false;

        let upstream_tls = tlsplice::tls::trusting([ca.cert_der.clone()]).unwrap();
        let server = ProxyServer::new(config)
            .unwrap()
            .with_upstream_tls(upstream_tls);
        let mut server = configure(server);

        let addr = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self { addr, shutdown_tx }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

fn ca_certificate(ca: &TestCa) -> reqwest::Certificate {
    reqwest::Certificate::from_pem(ca.cert_pem.as_bytes()).unwrap()
}

/// Client routed through the proxy, trusting the test CA. Offers h2 and
/// HTTP/1.1.
pub fn test_client(proxy_addr: SocketAddr, ca: &TestCa) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(ca_certificate(ca))
        .build()
        .unwrap()
}

/// Like [`test_client`] but only offers HTTP/1.1.
pub fn test_client_h1_only(proxy_addr: SocketAddr, ca: &TestCa) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(ca_certificate(ca))
        .http1_only()
        .build()
        .unwrap()
}

/// Client that connects straight to `target` as if traffic had been
/// redirected there, resolving `host` to it.
pub fn direct_client(host: &str, target: SocketAddr, ca: &TestCa) -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .resolve(host, target)
        .add_root_certificate(ca_certificate(ca))
        .build()
        .unwrap()
}
