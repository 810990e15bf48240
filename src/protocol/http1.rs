//! HTTP/1.1 interception.
//!
//! The client side serves HTTP/1.1 with hyper and turns each request into an
//! [`Exchange`]; the server side replays exchanges over a hyper client
//! connection. Bodies are buffered whole.

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::listener::{EventBuilder, InterceptionListener};
use crate::negotiation::{ConnectionContext, Inbox};
use crate::protocol::{BoxFuture, BoxedIo, Exchange, Message, ProtocolHandler, DRAIN_TIMEOUT};
use crate::proxy::response::{bad_gateway, error_response, full};

const VERSION: &str = "HTTP/1.1";

/// When a forwarded response's headers arrived. Set on responses read from a
/// server so the event is not stamped with the time the body finished.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResponseStarted(pub(crate) OffsetDateTime);

#[derive(Debug, Default, Clone, Copy)]
pub struct Http1Frontend;

#[derive(Debug, Default, Clone, Copy)]
pub struct Http1Backend;

impl ProtocolHandler for Http1Frontend {
    fn run(
        self: Box<Self>,
        io: BoxedIo,
        ctx: Arc<ConnectionContext>,
        inbox: Inbox,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(serve(io, ctx, inbox))
    }
}

impl ProtocolHandler for Http1Backend {
    fn run(
        self: Box<Self>,
        io: BoxedIo,
        ctx: Arc<ConnectionContext>,
        inbox: Inbox,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(replay(io, ctx, inbox))
    }
}

async fn serve(io: BoxedIo, ctx: Arc<ConnectionContext>, mut inbox: Inbox) -> Result<()> {
    let service_ctx = ctx.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = service_ctx.clone();
        async move { Ok::<_, Infallible>(full(exchange(&ctx, req).await)) }
    });
    let conn = hyper::server::conn::http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        served = conn.as_mut() => return served.map_err(Into::into),
        // Responses travel through each exchange's reply slot, so the inbox
        // only tells us when the pair is closed.
        _ = async {
            while let Some(message) = inbox.recv().await {
                tracing::warn!(kind = message.kind(), "Unexpected message on HTTP/1.1 client side");
            }
        } => {}
    }

    // The server side is gone. A response already being written still goes
    // out in full before the connection closes.
    tracing::debug!("Server side closed, finishing HTTP/1.1 client connection");
    conn.as_mut().graceful_shutdown();
    match tokio::time::timeout(DRAIN_TIMEOUT, conn).await {
        Ok(served) => served.map_err(Into::into),
        Err(_) => {
            tracing::debug!("Client did not finish reading the response in time");
            Ok(())
        }
    }
}

/// Handle one client request: substitute or forward, then report.
async fn exchange(ctx: &ConnectionContext, req: Request<Incoming>) -> Response<Bytes> {
    let mut event = EventBuilder::new(ctx.client_addr(), ctx.server_addr(), VERSION);
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read request body");
            return error_response(http::StatusCode::BAD_REQUEST, "unreadable request body");
        }
    };
    let mut request = Request::from_parts(parts, body);
    strip_framing(request.headers_mut());

    let host = request_host(&request).unwrap_or_else(|| ctx.server_addr().host);
    event.request(
        request.method().as_str(),
        &host,
        request
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/"),
    );
    event.request_body(request.body().len());

    let listener = ctx.services().listener.clone();
    let response = match listener.on_http1_request(&request) {
        Some(substitute) => {
            tracing::debug!(method = %request.method(), uri = %request.uri(), "Answering with substitute");
            substituted(listener.as_ref(), substitute)
        }
        None => forward(ctx, request).await.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Exchange failed");
            bad_gateway(&e.to_string())
        }),
    };

    report(listener.as_ref(), event, &response);
    response
}

/// Shows a substitute body to the listener the way a forwarded one would be.
pub(crate) fn substituted(listener: &dyn InterceptionListener, response: Response<Bytes>) -> Response<Bytes> {
    if !response.body().is_empty() {
        listener.on_http1_response_data(response.body());
    }
    response
}

/// Pass the complete response to the listener and emit its event.
pub(crate) fn report(listener: &dyn InterceptionListener, mut event: EventBuilder, response: &Response<Bytes>) {
    listener.on_http1_response(response);
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let status = response.status().as_u16();
    match response.extensions().get::<ResponseStarted>() {
        Some(ResponseStarted(at)) => event.response_at(status, content_type, *at),
        None => event.response(status, content_type),
    }
    event.response_body(response.body().len());
    listener.on_http_event(&event.finish());
}

/// Read a server's response body, handing each chunk to the listener as it
/// arrives.
pub(crate) async fn collect_response(
    response: Response<Incoming>,
    listener: &dyn InterceptionListener,
) -> Result<Response<Bytes>> {
    let started = ResponseStarted(OffsetDateTime::now_utc());
    let (mut parts, mut body) = response.into_parts();
    let mut collected = BytesMut::new();
    while let Some(frame) = body.frame().await {
        if let Some(data) = frame?.data_ref() {
            listener.on_http1_response_data(data);
            collected.extend_from_slice(data);
        }
    }
    parts.extensions.insert(started);
    Ok(Response::from_parts(parts, collected.freeze()))
}

async fn forward(ctx: &ConnectionContext, request: Request<Bytes>) -> Result<Response<Bytes>> {
    let (reply, response) = oneshot::channel();
    ctx.server()
        .write(Message::Exchange(Exchange { request, reply }))?;
    response.await.map_err(|_| Error::ChannelClosed)?
}

async fn replay(io: BoxedIo, ctx: Arc<ConnectionContext>, mut inbox: Inbox) -> Result<()> {
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(io)).await?;
    let mut connection = tokio::spawn(connection);
    tracing::debug!(server = %ctx.server_addr(), "HTTP/1.1 server connection established");
    let listener = ctx.services().listener.clone();

    loop {
        let exchange = tokio::select! {
            finished = &mut connection => {
                return match finished {
                    Ok(result) => result.map_err(Into::into),
                    Err(e) => Err(Error::proxy(format!("HTTP/1.1 connection task failed: {}", e))),
                };
            }
            message = inbox.recv() => match message {
                None => break,
                Some(Message::Exchange(exchange)) => exchange,
                Some(other) => {
                    tracing::warn!(kind = other.kind(), "Unexpected message on HTTP/1.1 server side");
                    continue;
                }
            },
        };

        let Exchange { request, reply } = exchange;
        let result = tokio::select! {
            result = send(&mut sender, request, listener.as_ref()) => result,
            _ = ctx.closed() => {
                tracing::debug!("Pair closed while waiting on the server");
                let _ = reply.send(Err(Error::ChannelClosed));
                break;
            }
        };
        let failed = result.is_err();
        let _ = reply.send(result);
        if failed {
            // The connection is unusable after a failed exchange.
            break;
        }
    }

    connection.abort();
    Ok(())
}

async fn send(
    sender: &mut hyper::client::conn::http1::SendRequest<Full<Bytes>>,
    request: Request<Bytes>,
    listener: &dyn InterceptionListener,
) -> Result<Response<Bytes>> {
    sender.ready().await?;
    let response = sender.send_request(request.map(Full::new)).await?;
    let mut response = collect_response(response, listener).await?;
    strip_framing(response.headers_mut());
    Ok(response)
}

/// The body is re-framed after buffering; hyper sets the length.
fn strip_framing(headers: &mut HeaderMap) {
    headers.remove(TRANSFER_ENCODING);
}

fn request_host<B>(request: &Request<B>) -> Option<String> {
    let authority = request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))?;
    let host: http::uri::Authority = authority.parse().ok()?;
    Some(host.host().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyMode;
    use crate::negotiation::testing::{services, RecordingConnector};
    use crate::negotiation::Address;
    use std::time::Duration;
    use tlsplice_test_support::test_report;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn context(id: u64) -> Arc<ConnectionContext> {
        let (connector, _server_end) = RecordingConnector::duplex();
        ConnectionContext::new(
            id,
            "127.0.0.1:42000".parse().unwrap(),
            Address::new("api.example.com", 443),
            services(ProxyMode::Explicit, connector),
        )
    }

    #[tokio::test]
    async fn test_response_in_flight_survives_server_close() {
        let t = test_report!("Client still receives a response answered after the server side closed");
        let ctx = context(30);
        let inbox = ctx.client().install().unwrap();
        let mut server_inbox = ctx.server().install().unwrap();

        let (mut client, proxy_side) = tokio::io::duplex(16 * 1024);
        let frontend = tokio::spawn(Box::new(Http1Frontend).run(
            Box::new(proxy_side),
            ctx.clone(),
            inbox,
        ));

        client
            .write_all(b"GET /last HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
            .await
            .unwrap();
        let Some(Message::Exchange(Exchange { request, reply })) = server_inbox.recv().await else {
            panic!("expected an exchange");
        };
        t.assert_eq("path", &request.uri().path(), &"/last");

        // Server answered with Connection: close and went away.
        ctx.close("server finished");
        let response = Response::builder()
            .status(200)
            .body(Bytes::from_static(b"final answer"))
            .unwrap();
        let _ = reply.send(Ok(response));

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .expect("client connection should end")
            .unwrap();
        let text = String::from_utf8_lossy(&received);
        t.assert_contains("status line", &text, "HTTP/1.1 200");
        t.assert_contains("body", &text, "final answer");

        let served = tokio::time::timeout(Duration::from_secs(5), frontend)
            .await
            .expect("frontend should finish")
            .unwrap();
        t.assert_true("frontend finished cleanly", served.is_ok());
    }

    #[tokio::test]
    async fn test_replay_stops_waiting_when_pair_closes() {
        let t = test_report!("A server that never answers does not hold the pair open after close");
        let ctx = context(31);
        let inbox = ctx.server().install().unwrap();

        // The server accepts the connection but never responds.
        let (_silent_server, proxy_side) = tokio::io::duplex(16 * 1024);
        let backend = tokio::spawn(Box::new(Http1Backend).run(
            Box::new(proxy_side),
            ctx.clone(),
            inbox,
        ));

        let (reply, response) = oneshot::channel();
        let request = Request::builder()
            .uri("/hang")
            .header(HOST, "api.example.com")
            .body(Bytes::new())
            .unwrap();
        ctx.server()
            .write(Message::Exchange(Exchange { request, reply }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.close("client disconnected");

        let finished = tokio::time::timeout(Duration::from_secs(2), backend)
            .await
            .expect("backend should stop once closed")
            .unwrap();
        t.assert_true("backend finished cleanly", finished.is_ok());
        let answer = response.await.unwrap();
        t.assert_true("exchange failed", answer.is_err());
    }

    #[test]
    fn test_request_host_prefers_host_header() {
        let t = test_report!("Event host comes from the Host header without port");
        let request = Request::builder()
            .uri("/status")
            .header(HOST, "api.example.com:8443")
            .body(())
            .unwrap();
        t.assert_eq(
            "host",
            &request_host(&request),
            &Some("api.example.com".to_string()),
        );

        let absolute = Request::builder()
            .uri("http://plain.example.com/")
            .body(())
            .unwrap();
        t.assert_eq(
            "absolute uri",
            &request_host(&absolute),
            &Some("plain.example.com".to_string()),
        );

        let bare = Request::builder().uri("/").body(()).unwrap();
        t.assert_eq("none", &request_host(&bare), &None);
    }

    #[test]
    fn test_strip_framing() {
        let t = test_report!("Transfer-Encoding is dropped from buffered messages");
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(CONTENT_TYPE, "text/plain".parse().unwrap());
        strip_framing(&mut headers);
        t.assert_true("no transfer-encoding", !headers.contains_key(TRANSFER_ENCODING));
        t.assert_true("others kept", headers.contains_key(CONTENT_TYPE));
    }
}
