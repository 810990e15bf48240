//! Callbacks into intercepted traffic.

use bytes::Bytes;
use http::{Request, Response};
use std::net::SocketAddr;
use time::OffsetDateTime;

use crate::negotiation::Address;
use crate::protocol::http2::{FrameBatch, Http2Frame};

/// One completed request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResponseEvent {
    pub client: SocketAddr,
    pub server: Address,
    pub method: String,
    /// `HTTP/2` or `HTTP/1.1`
    pub version: &'static str,
    pub host: String,
    pub path: String,
    pub request_time: OffsetDateTime,
    pub request_body_size: u64,
    pub status: u16,
    pub content_type: Option<String>,
    pub response_time: OffsetDateTime,
    pub response_body_size: u64,
}

/// Observer and interceptor of traffic passing through the proxy.
///
/// Every method defaults to doing nothing. Callbacks run on connection tasks
/// and must not block.
pub trait InterceptionListener: Send + Sync {
    /// A complete HTTP/2 request. Returning a batch answers the client with
    /// it instead of forwarding the request.
    fn on_http2_request(&self, request: &FrameBatch) -> Option<FrameBatch> {
        let _ = request;
        None
    }

    /// Every frame written back to an HTTP/2 client. Frames of a batch
    /// returned from [`on_http2_request`](Self::on_http2_request) pass
    /// through here too, restamped to the client's stream id, exactly like
    /// frames that came from the server.
    fn on_http2_response_frame(&self, frame: &Http2Frame) {
        let _ = frame;
    }

    /// A complete HTTP/1.1 request. Returning a response answers the client
    /// with it instead of forwarding the request.
    fn on_http1_request(&self, request: &Request<Bytes>) -> Option<Response<Bytes>> {
        let _ = request;
        None
    }

    fn on_http1_response(&self, response: &Response<Bytes>) {
        let _ = response;
    }

    /// A chunk of an HTTP/1.1 response body as it arrives, before the
    /// complete response reaches [`on_http1_response`](Self::on_http1_response).
    /// A substitute body is passed as a single chunk.
    fn on_http1_response_data(&self, data: &Bytes) {
        let _ = data;
    }

    fn on_http_event(&self, event: &RequestResponseEvent) {
        let _ = event;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl InterceptionListener for NoopListener {}

/// Logs each completed exchange at info.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl InterceptionListener for LoggingListener {
    fn on_http_event(&self, event: &RequestResponseEvent) {
        let elapsed = event.response_time - event.request_time;
        tracing::info!(
            client = %event.client,
            server = %event.server,
            method = %event.method,
            version = event.version,
            host = %event.host,
            path = %event.path,
            status = event.status,
            content_type = event.content_type.as_deref().unwrap_or("-"),
            request_bytes = event.request_body_size,
            response_bytes = event.response_body_size,
            elapsed_ms = elapsed.whole_milliseconds() as i64,
            "Request completed"
        );
    }
}

/// Accumulates an event while an exchange is in flight.
#[derive(Debug, Clone)]
pub(crate) struct EventBuilder {
    client: SocketAddr,
    server: Address,
    version: &'static str,
    method: String,
    host: String,
    path: String,
    request_time: OffsetDateTime,
    request_body_size: u64,
    status: u16,
    content_type: Option<String>,
    response_time: Option<OffsetDateTime>,
    response_body_size: u64,
}

impl EventBuilder {
    pub(crate) fn new(client: SocketAddr, server: Address, version: &'static str) -> Self {
        Self {
            client,
            server,
            version,
            method: String::new(),
            host: String::new(),
            path: String::new(),
            request_time: OffsetDateTime::now_utc(),
            request_body_size: 0,
            status: 0,
            content_type: None,
            response_time: None,
            response_body_size: 0,
        }
    }

    pub(crate) fn request(&mut self, method: &str, host: &str, path: &str) {
        self.method = method.to_string();
        self.host = host.to_string();
        self.path = path.to_string();
    }

    pub(crate) fn request_body(&mut self, len: usize) {
        self.request_body_size += len as u64;
    }

    /// Response headers arrived now.
    pub(crate) fn response(&mut self, status: u16, content_type: Option<String>) {
        self.response_at(status, content_type, OffsetDateTime::now_utc());
    }

    pub(crate) fn response_at(&mut self, status: u16, content_type: Option<String>, at: OffsetDateTime) {
        self.status = status;
        self.content_type = content_type;
        self.response_time = Some(at);
    }

    pub(crate) fn response_body(&mut self, len: usize) {
        self.response_body_size += len as u64;
    }

    pub(crate) fn finish(self) -> RequestResponseEvent {
        RequestResponseEvent {
            client: self.client,
            server: self.server,
            method: self.method,
            version: self.version,
            host: self.host,
            path: self.path,
            request_time: self.request_time,
            request_body_size: self.request_body_size,
            status: self.status,
            content_type: self.content_type,
            response_time: self.response_time.unwrap_or_else(OffsetDateTime::now_utc),
            response_body_size: self.response_body_size,
        }
    }
}
