//! HTTP request handler for explicit proxy mode

use bytes::Bytes;
use http::header::HOST;
use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;

use super::response::{bad_gateway, error_response, full};
use crate::error::{Error, Result};
use crate::listener::{EventBuilder, InterceptionListener};
use crate::negotiation::{self, Address, ConnectionContext, Services};
use crate::protocol::http1::{collect_response, report, substituted};

/// Hop-by-hop headers that must not be forwarded (RFC 7230 §6.1).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handles one request on an explicit-mode client connection.
pub struct ProxyHandler {
    id: u64,
    client_addr: SocketAddr,
    services: Arc<Services>,
}

impl ProxyHandler {
    pub fn new(id: u64, client_addr: SocketAddr, services: Arc<Services>) -> Self {
        Self {
            id,
            client_addr,
            services,
        }
    }

    pub async fn handle(
        self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req));
        }
        Ok(full(self.handle_http(req).await))
    }

    /// Answer 200 and hand the upgraded stream to the negotiation pipelines.
    fn handle_connect(self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let target = match req.uri().authority() {
            Some(authority) => Address::parse(authority.as_str(), 443),
            None => Err(Error::proxy("CONNECT without authority")),
        };
        let target = match target {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(uri = %req.uri(), error = %e, "Rejecting CONNECT");
                return full(error_response(StatusCode::BAD_REQUEST, &e.to_string()));
            }
        };

        tracing::debug!(server = %target, "CONNECT request");

        let upgrade = hyper::upgrade::on(req);
        // The server stays the CONNECT target; a ClientHello SNI only picks the certificate.
        let ctx = ConnectionContext::new(self.id, self.client_addr, target, self.services);

        tokio::spawn(
            async move {
                let upgraded = match upgrade.await {
                    Ok(u) => u,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to upgrade connection");
                        ctx.close("upgrade failed");
                        return;
                    }
                };
                // Failures are logged by the pipelines themselves.
                let _ = negotiation::serve_connection(ctx, TokioIo::new(upgraded)).await;
            }
            .instrument(tracing::Span::current()),
        );

        Response::new(Full::new(Bytes::new()))
    }

    /// Forward an absolute-URI request in the clear and report it.
    async fn handle_http(self, req: Request<Incoming>) -> Response<Bytes> {
        let uri = req.uri().clone();
        let Some(host) = uri.host().map(|h| h.trim_matches(&['[', ']'][..]).to_string()) else {
            return error_response(StatusCode::BAD_REQUEST, "request URI must be absolute");
        };
        let target = Address::new(host.clone(), uri.port_u16().unwrap_or(80));
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let mut event = EventBuilder::new(self.client_addr, target.clone(), "HTTP/1.1");
        event.request(req.method().as_str(), &host, &path);

        let (mut parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read request body");
                return error_response(StatusCode::BAD_REQUEST, "unreadable request body");
            }
        };
        event.request_body(body.len());

        strip_hop_by_hop(&mut parts.headers);
        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = uri.authority() {
                if let Ok(value) = authority.as_str().parse() {
                    parts.headers.insert(HOST, value);
                }
            }
        }
        parts.uri = match path.parse() {
            Ok(relative) => relative,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("{}", e)),
        };
        let request = Request::from_parts(parts, body);

        let listener = self.services.listener.clone();
        let response = match listener.on_http1_request(&request) {
            Some(substitute) => substituted(listener.as_ref(), substitute),
            None => match self.forward(&target, request, listener.as_ref()).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::error!(server = %target, error = %e, "HTTP forwarding error");
                    bad_gateway(&e.to_string())
                }
            },
        };

        report(listener.as_ref(), event, &response);
        response
    }

    async fn forward(
        &self,
        target: &Address,
        request: Request<Bytes>,
        listener: &dyn InterceptionListener,
    ) -> Result<Response<Bytes>> {
        let io = self
            .services
            .connector
            .connect(target)
            .await
            .map_err(|e| Error::upstream_connect(target, e))?;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(io)).await?;
        tokio::spawn(
            async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "HTTP upstream connection error");
                }
            }
            .in_current_span(),
        );

        let response = sender.send_request(request.map(Full::new)).await?;
        let mut response = collect_response(response, listener).await?;
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
