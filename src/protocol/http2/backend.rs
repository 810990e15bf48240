//! Server-facing HTTP/2: replays forwarded frames with an h2 client.

use bytes::Bytes;
use h2::client::ResponseFuture;
use h2::{Reason, SendStream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::Instrument;

use super::frame::{Http2Frame, Http2Headers};
use super::FlowRelease;
use crate::error::{Error, Result};
use crate::negotiation::{ConnectionContext, Inbox};
use crate::protocol::{BoxFuture, BoxedIo, Message, ProtocolHandler, DRAIN_TIMEOUT};

#[derive(Debug, Default, Clone, Copy)]
pub struct Http2Backend;

impl ProtocolHandler for Http2Backend {
    fn run(
        self: Box<Self>,
        io: BoxedIo,
        ctx: Arc<ConnectionContext>,
        inbox: Inbox,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(replay(io, ctx, inbox))
    }
}

async fn replay(io: BoxedIo, ctx: Arc<ConnectionContext>, mut inbox: Inbox) -> Result<()> {
    let settings = ctx.services().http2;
    let (mut client, connection) = h2::client::Builder::new()
        .initial_window_size(settings.initial_window_size)
        .max_concurrent_streams(settings.max_concurrent_streams)
        .max_frame_size(settings.max_frame_size)
        .handshake::<_, Bytes>(io)
        .await?;
    let mut connection = tokio::spawn(connection);
    tracing::debug!("HTTP/2 server connection established");

    let authority = ctx.server_addr().to_string();
    // Request bodies still being sent, keyed by the client's stream id.
    let mut requests: HashMap<u32, SendStream<Bytes>> = HashMap::new();
    // Response relays; each one writes its stream's frames back to the client.
    let mut relays = JoinSet::new();
    let mut responses: HashMap<u32, AbortHandle> = HashMap::new();

    loop {
        let (frame, release) = tokio::select! {
            finished = &mut connection => {
                let finished = match finished {
                    Ok(result) => result.map_err(Error::from),
                    Err(e) => Err(Error::proxy(format!("HTTP/2 connection task failed: {}", e))),
                };
                // Responses the server finished before going away still reach the client.
                if tokio::time::timeout(DRAIN_TIMEOUT, async {
                    while relays.join_next().await.is_some() {}
                })
                .await
                .is_err()
                {
                    tracing::debug!("Response relays still running after server closed");
                }
                return finished;
            }
            Some(_) = relays.join_next(), if !relays.is_empty() => {
                responses.retain(|_, relay| !relay.is_finished());
                continue;
            }
            message = inbox.recv() => match message {
                None => break,
                Some(Message::Frame(frame, release)) => (frame, release),
                Some(other) => {
                    tracing::warn!(kind = other.kind(), "Unexpected message on HTTP/2 server side");
                    continue;
                }
            },
        };

        match frame {
            Http2Frame::Headers {
                stream_id,
                headers,
                end_stream,
            } => {
                if let Some(mut body) = requests.remove(&stream_id) {
                    if let Err(e) = body.send_trailers(headers.fields) {
                        tracing::debug!(stream = stream_id, error = %e, "Server stream gone");
                    }
                    continue;
                }
                client = tokio::select! {
                    ready = client.ready() => ready?,
                    _ = ctx.closed() => break,
                };
                match open_stream(&mut client, headers, end_stream, &authority) {
                    Ok((response, body)) => {
                        if let Some(body) = body {
                            requests.insert(stream_id, body);
                        }
                        let relay = relays
                            .spawn(relay_response(ctx.clone(), stream_id, response).in_current_span());
                        responses.insert(stream_id, relay);
                    }
                    Err(e) => {
                        tracing::warn!(stream = stream_id, error = %e, "Request rejected");
                        write_back(
                            &ctx,
                            Http2Frame::Reset {
                                stream_id,
                                reason: Reason::REFUSED_STREAM.into(),
                            },
                            None,
                        );
                    }
                }
            }
            Http2Frame::Data {
                stream_id,
                data,
                end_stream,
            } => {
                let Some(body) = requests.get_mut(&stream_id) else {
                    tracing::trace!(stream = stream_id, "DATA for unknown stream");
                    continue;
                };
                body.reserve_capacity(data.len());
                let sent = body.send_data(data, end_stream);
                // Request bodies are held whole by the client side already.
                drop(release);
                if end_stream || sent.is_err() {
                    requests.remove(&stream_id);
                }
            }
            Http2Frame::Reset { stream_id, reason } => {
                if let Some(mut body) = requests.remove(&stream_id) {
                    body.send_reset(Reason::from(reason));
                }
                // Dropping the response stream cancels it on the server.
                if let Some(relay) = responses.remove(&stream_id) {
                    relay.abort();
                }
            }
        }
    }

    relays.abort_all();
    connection.abort();
    Ok(())
}

fn open_stream(
    client: &mut h2::client::SendRequest<Bytes>,
    headers: Http2Headers,
    end_stream: bool,
    authority: &str,
) -> Result<(ResponseFuture, Option<SendStream<Bytes>>)> {
    let request = headers.into_request(authority)?;
    let (response, body) = client.send_request(request, end_stream)?;
    Ok((response, (!end_stream).then_some(body)))
}

async fn relay_response(ctx: Arc<ConnectionContext>, stream_id: u32, response: ResponseFuture) {
    let response = match response.await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(stream = stream_id, error = %e, "Server reset stream");
            write_back(
                &ctx,
                Http2Frame::Reset {
                    stream_id,
                    reason: e.reason().unwrap_or(Reason::INTERNAL_ERROR).into(),
                },
                None,
            );
            return;
        }
    };

    let (parts, body) = response.into_parts();
    let end_stream = body.is_end_stream();
    let headers = Http2Frame::Headers {
        stream_id,
        headers: Http2Headers::from_response_parts(&parts),
        end_stream,
    };
    if !write_back(&ctx, headers, None) || end_stream {
        return;
    }
    super::relay_body(stream_id, body, |frame, release| write_back(&ctx, frame, release)).await;
}

/// Hand a response frame to the client side. A DATA frame's credit goes back
/// to the server only once the client side has written it.
fn write_back(ctx: &ConnectionContext, frame: Http2Frame, release: Option<FlowRelease>) -> bool {
    ctx.client().write(Message::Frame(frame, release)).is_ok()
}
