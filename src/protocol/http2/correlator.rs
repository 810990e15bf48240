//! Per-stream bookkeeping for an intercepted HTTP/2 connection.
//!
//! Owned by the client-side h2 handler. Requests are assembled frame by frame
//! and offered to the listener once complete; responses are observed on
//! their way back to the client and turned into one event per stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::frame::{FrameBatch, Http2Frame};
use crate::listener::{EventBuilder, InterceptionListener};
use crate::negotiation::Address;

const VERSION: &str = "HTTP/2";

/// Protocol violations scoped to one stream. The stream is reset; its
/// siblings carry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("DATA before HEADERS on stream {0}")]
    DataBeforeHeaders(u32),
    #[error("frame after end of request on stream {0}")]
    RequestComplete(u32),
}

impl StreamError {
    pub fn stream_id(&self) -> u32 {
        match self {
            StreamError::DataBeforeHeaders(id) | StreamError::RequestComplete(id) => *id,
        }
    }
}

/// What to do with a completed request.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    /// Send these frames to the server unchanged.
    Forward(Vec<Http2Frame>),
    /// Write these frames to the client only.
    Respond(Vec<Http2Frame>),
}

struct StreamCollector {
    request: Vec<Http2Frame>,
    request_done: bool,
    event: EventBuilder,
}

pub struct Http2StreamCorrelator {
    client: SocketAddr,
    server: Address,
    listener: Arc<dyn InterceptionListener>,
    streams: HashMap<u32, StreamCollector>,
}

impl Http2StreamCorrelator {
    pub fn new(client: SocketAddr, server: Address, listener: Arc<dyn InterceptionListener>) -> Self {
        Self {
            client,
            server,
            listener,
            streams: HashMap::new(),
        }
    }

    /// Feed one frame received from the client.
    ///
    /// Returns the assembled request once its stream ends. A reset releases
    /// the stream and yields nothing.
    pub fn on_request_frame(
        &mut self,
        frame: Http2Frame,
    ) -> Result<Option<FrameBatch>, StreamError> {
        let id = frame.stream_id();
        if let Http2Frame::Reset { .. } = frame {
            self.on_stream_reset(id);
            return Ok(None);
        }
        if self.streams.get(&id).is_some_and(|c| c.request_done) {
            self.streams.remove(&id);
            return Err(StreamError::RequestComplete(id));
        }
        if !self.streams.contains_key(&id) {
            let Http2Frame::Headers { headers, .. } = &frame else {
                return Err(StreamError::DataBeforeHeaders(id));
            };
            let mut event = EventBuilder::new(self.client, self.server.clone(), VERSION);
            let host = headers
                .authority
                .as_deref()
                .map(authority_host)
                .unwrap_or(&self.server.host);
            event.request(
                headers.method.as_ref().map(|m| m.as_str()).unwrap_or(""),
                host,
                headers.path.as_deref().unwrap_or("/"),
            );
            self.streams.insert(
                id,
                StreamCollector {
                    request: Vec::new(),
                    request_done: false,
                    event,
                },
            );
        }
        let Some(collector) = self.streams.get_mut(&id) else {
            return Ok(None);
        };

        collector.event.request_body(frame.data_len());
        let end = frame.is_end_stream();
        collector.request.push(frame);
        if !end {
            return Ok(None);
        }
        collector.request_done = true;
        let frames = std::mem::take(&mut collector.request);
        Ok(Some(FrameBatch::new(id, frames)))
    }

    /// Offer a completed request to the listener.
    ///
    /// A substitute is restamped onto the request's stream. Its frames must
    /// still pass through [`on_response_frame`](Self::on_response_frame)
    /// as they are written to the client.
    pub fn dispatch(&self, request: FrameBatch) -> Dispatch {
        match self.listener.on_http2_request(&request) {
            None => Dispatch::Forward(request.into_frames()),
            Some(substitute) => {
                tracing::debug!(stream = request.stream_id(), "Answering stream with substitute");
                Dispatch::Respond(substitute.with_stream_id(request.stream_id()).into_frames())
            }
        }
    }

    /// Observe one frame on its way to the client. Returns true when it ends
    /// the stream; the stream's event is emitted at that point.
    pub fn on_response_frame(&mut self, frame: &Http2Frame) -> bool {
        self.listener.on_http2_response_frame(frame);

        let id = frame.stream_id();
        if let Http2Frame::Reset { .. } = frame {
            self.on_stream_reset(id);
            return true;
        }
        let Some(collector) = self.streams.get_mut(&id) else {
            return frame.is_end_stream();
        };
        match frame {
            Http2Frame::Headers { headers, .. } => {
                if let Some(status) = headers.status {
                    collector.event.response(status.as_u16(), headers.content_type());
                }
            }
            Http2Frame::Data { data, .. } => collector.event.response_body(data.len()),
            Http2Frame::Reset { .. } => {}
        }
        if !frame.is_end_stream() {
            return false;
        }

        if let Some(collector) = self.streams.remove(&id) {
            let event = collector.event.finish();
            self.listener.on_http_event(&event);
        }
        true
    }

    /// Drop a stream's collector without emitting an event.
    pub fn on_stream_reset(&mut self, stream_id: u32) -> bool {
        let released = self.streams.remove(&stream_id).is_some();
        if released {
            tracing::debug!(stream = stream_id, "Stream reset");
        }
        released
    }

    /// Drop every remaining collector without events. Returns how many.
    pub fn teardown(&mut self) -> usize {
        let released = self.streams.len();
        self.streams.clear();
        if released > 0 {
            tracing::debug!(released, "Released unfinished streams");
        }
        released
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}

/// Host part of an authority, without port or IPv6 brackets.
fn authority_host(authority: &str) -> &str {
    let host = match authority.rfind(':') {
        Some(i) if !authority[i..].contains(']') => &authority[..i],
        _ => authority,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
