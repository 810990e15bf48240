//! Client-facing HTTP/2: an h2 server feeding the correlator.

use bytes::Bytes;
use h2::server::{Connection, SendResponse};
use h2::{Reason, SendStream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::correlator::{Dispatch, Http2StreamCorrelator};
use super::frame::{Http2Frame, Http2Headers};
use super::FlowRelease;
use crate::error::{Error, Result};
use crate::negotiation::{ConnectionContext, Inbox};
use crate::protocol::{BoxFuture, BoxedIo, Message, ProtocolHandler, DRAIN_TIMEOUT};

#[derive(Debug, Default, Clone, Copy)]
pub struct Http2Frontend;

impl ProtocolHandler for Http2Frontend {
    fn run(
        self: Box<Self>,
        io: BoxedIo,
        ctx: Arc<ConnectionContext>,
        inbox: Inbox,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(serve(io, ctx, inbox))
    }
}

type Outbound = (Http2Frame, Option<FlowRelease>);

/// Where a stream's response goes next.
enum Responder {
    AwaitingHeaders(SendResponse<Bytes>),
    /// Body and trailers go through the stream's writer task.
    Streaming(mpsc::UnboundedSender<Outbound>),
}

struct ClientSide {
    ctx: Arc<ConnectionContext>,
    correlator: Http2StreamCorrelator,
    responders: HashMap<u32, Responder>,
}

/// Which side ended the main loop.
enum Ended {
    Client,
    Server,
}

async fn serve(io: BoxedIo, ctx: Arc<ConnectionContext>, mut inbox: Inbox) -> Result<()> {
    let settings = ctx.services().http2;
    let mut conn = h2::server::Builder::new()
        .initial_window_size(settings.initial_window_size)
        .max_concurrent_streams(settings.max_concurrent_streams)
        .max_frame_size(settings.max_frame_size)
        .handshake::<_, Bytes>(io)
        .await?;
    tracing::debug!("HTTP/2 client connection established");

    let mut side = ClientSide {
        correlator: Http2StreamCorrelator::new(
            ctx.client_addr(),
            ctx.server_addr(),
            ctx.services().listener.clone(),
        ),
        ctx,
        responders: HashMap::new(),
    };
    let (body_tx, mut body_rx) = mpsc::unbounded_channel::<Outbound>();

    let ended = loop {
        tokio::select! {
            accepted = conn.accept() => match accepted {
                None => break Ok(Ended::Client),
                Some(Ok((request, respond))) => {
                    let stream_id = respond.stream_id().as_u32();
                    let (parts, body) = request.into_parts();
                    let end_stream = body.is_end_stream();
                    side.responders.insert(stream_id, Responder::AwaitingHeaders(respond));
                    if !end_stream {
                        let tx = body_tx.clone();
                        tokio::spawn(super::relay_body(stream_id, body, move |frame, release| {
                            tx.send((frame, release)).is_ok()
                        }));
                    }
                    let headers = Http2Frame::Headers {
                        stream_id,
                        headers: Http2Headers::from_request_parts(&parts),
                        end_stream,
                    };
                    if let Err(e) = side.client_frame(headers) {
                        break Err(e);
                    }
                }
                Some(Err(e)) if e.reason() == Some(Reason::NO_ERROR) => break Ok(Ended::Client),
                Some(Err(e)) => break Err(e.into()),
            },
            Some((frame, release)) = body_rx.recv() => {
                // Request bodies are collected whole before dispatch, so their
                // credit goes back as soon as the correlator has the bytes.
                let absorbed = side.client_frame(frame);
                drop(release);
                if let Err(e) = absorbed {
                    break Err(e);
                }
            }
            message = inbox.recv() => match message {
                None => break Ok(Ended::Server),
                Some(Message::Frame(frame, release)) => side.deliver(frame, release),
                Some(other) => {
                    tracing::warn!(kind = other.kind(), "Unexpected message on HTTP/2 client side");
                }
            },
        }
    };

    side.correlator.teardown();
    match ended? {
        Ended::Client => Ok(()),
        Ended::Server => side.drain(&mut conn).await,
    }
}

impl ClientSide {
    /// A frame read from the client.
    fn client_frame(&mut self, frame: Http2Frame) -> Result<()> {
        let stream_id = frame.stream_id();
        if let Http2Frame::Reset { .. } = frame {
            self.correlator.on_stream_reset(stream_id);
            self.responders.remove(&stream_id);
            return self.ctx.server().write(Message::Frame(frame, None));
        }

        match self.correlator.on_request_frame(frame) {
            Ok(None) => Ok(()),
            Ok(Some(request)) => match self.correlator.dispatch(request) {
                Dispatch::Forward(frames) => {
                    for frame in frames {
                        self.ctx.server().write(Message::Frame(frame, None))?;
                    }
                    Ok(())
                }
                Dispatch::Respond(frames) => {
                    for frame in frames {
                        self.deliver(frame, None);
                    }
                    Ok(())
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Resetting stream");
                self.reset(stream_id, Reason::PROTOCOL_ERROR);
                Ok(())
            }
        }
    }

    /// A response frame headed for the client, from the server or a substitute.
    fn deliver(&mut self, frame: Http2Frame, release: Option<FlowRelease>) {
        self.correlator.on_response_frame(&frame);

        let stream_id = frame.stream_id();
        let Some(responder) = self.responders.remove(&stream_id) else {
            tracing::trace!(stream = stream_id, "Dropping frame for closed stream");
            return;
        };

        match responder {
            Responder::Streaming(tx) => {
                let end_stream = frame.is_end_stream();
                if tx.send((frame, release)).is_ok() && !end_stream {
                    self.responders.insert(stream_id, Responder::Streaming(tx));
                }
            }
            Responder::AwaitingHeaders(respond) => self.respond(stream_id, respond, frame),
        }
    }

    fn respond(&mut self, stream_id: u32, mut respond: SendResponse<Bytes>, frame: Http2Frame) {
        match frame {
            Http2Frame::Reset { reason, .. } => respond.send_reset(Reason::from(reason)),
            Http2Frame::Headers { headers, .. }
                if headers.status.is_some_and(|s| s.is_informational()) =>
            {
                self.responders
                    .insert(stream_id, Responder::AwaitingHeaders(respond));
            }
            Http2Frame::Headers {
                headers,
                end_stream,
                ..
            } => {
                let sent = headers.into_response().and_then(|response| {
                    respond
                        .send_response(response, end_stream)
                        .map_err(Error::from)
                });
                match sent {
                    Ok(send) if !end_stream => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        tokio::spawn(write_body(stream_id, send, rx).in_current_span());
                        self.responders.insert(stream_id, Responder::Streaming(tx));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(stream = stream_id, error = %e, "Client stream gone"),
                }
            }
            Http2Frame::Data { .. } => {
                tracing::warn!(stream = stream_id, "DATA before response HEADERS");
                respond.send_reset(Reason::INTERNAL_ERROR);
            }
        }
    }

    fn reset(&mut self, stream_id: u32, reason: Reason) {
        self.correlator.on_stream_reset(stream_id);
        if let Some(responder) = self.responders.remove(&stream_id) {
            send_reset(stream_id, responder, reason);
        }
    }

    /// The server side is gone and every frame it produced has been handed
    /// over. Finish writing those, cancel streams that will never be
    /// answered, and close the connection with GOAWAY.
    async fn drain(&mut self, conn: &mut Connection<BoxedIo, Bytes>) -> Result<()> {
        for (stream_id, responder) in self.responders.drain() {
            tracing::debug!(stream = stream_id, "Server side closed before the response ended");
            send_reset(stream_id, responder, Reason::CANCEL);
        }
        conn.graceful_shutdown();

        let finish = async {
            while let Some(accepted) = conn.accept().await {
                match accepted {
                    Ok((_, mut respond)) => respond.send_reset(Reason::REFUSED_STREAM),
                    Err(e) if e.reason() == Some(Reason::NO_ERROR) => break,
                    Err(e) => return Err(Error::from(e)),
                }
            }
            Ok(())
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, finish).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Client did not finish reading responses in time");
                Ok(())
            }
        }
    }
}

/// Write one response body to the client as its window allows, handing the
/// server's credit back only after each chunk is sent.
async fn write_body(
    stream_id: u32,
    mut send: SendStream<Bytes>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some((frame, release)) = rx.recv().await {
        let written = match frame {
            Http2Frame::Data {
                data, end_stream, ..
            } => send_data(&mut send, data, end_stream).await,
            Http2Frame::Headers { headers, .. } => send.send_trailers(headers.fields).map(|()| true),
            Http2Frame::Reset { reason, .. } => {
                send.send_reset(Reason::from(reason));
                Ok(true)
            }
        };
        drop(release);
        match written {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(stream = stream_id, error = %e, "Client stream gone");
                return;
            }
        }
    }
    // The server side ended without finishing this body.
    send.send_reset(Reason::CANCEL);
}

/// Send `data` once the client has granted capacity for it. Returns whether
/// the stream ended.
async fn send_data(
    send: &mut SendStream<Bytes>,
    mut data: Bytes,
    end_stream: bool,
) -> std::result::Result<bool, h2::Error> {
    if data.is_empty() {
        send.send_data(data, end_stream)?;
        return Ok(end_stream);
    }
    while !data.is_empty() {
        send.reserve_capacity(data.len());
        let granted = match std::future::poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(granted) => granted?,
            None => return Err(h2::Error::from(Reason::CANCEL)),
        };
        if granted == 0 {
            continue;
        }
        let chunk = data.split_to(granted.min(data.len()));
        send.send_data(chunk, end_stream && data.is_empty())?;
    }
    Ok(end_stream)
}

fn send_reset(stream_id: u32, responder: Responder, reason: Reason) {
    match responder {
        Responder::AwaitingHeaders(mut respond) => respond.send_reset(reason),
        Responder::Streaming(tx) => {
            let _ = tx.send((
                Http2Frame::Reset {
                    stream_id,
                    reason: reason.into(),
                },
                None,
            ));
        }
    }
}
