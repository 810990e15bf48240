//! HTTP/2 interception.
//!
//! The client side serves h2 to the client and converts every stream into
//! [`Http2Frame`]s; the [`Http2StreamCorrelator`] decides which requests reach
//! the server. The server side replays forwarded frames with an h2 client and
//! sends the responses back the same way.

mod backend;
pub mod correlator;
mod frame;
mod frontend;

use h2::{FlowControl, Reason, RecvStream};
use std::fmt;

pub use backend::Http2Backend;
pub use correlator::{Dispatch, Http2StreamCorrelator, StreamError};
pub use frame::{FrameBatch, Http2Frame, Http2Headers};
pub use frontend::Http2Frontend;

/// Flow-control credit for received DATA, returned to the sender on drop.
///
/// Whoever writes the frame out holds it until the bytes are on their way,
/// so a slow reader on one side stalls the sender on the other instead of
/// piling data up in the proxy.
pub struct FlowRelease {
    flow: FlowControl,
    len: usize,
}

impl FlowRelease {
    fn new(flow: FlowControl, len: usize) -> Self {
        Self { flow, len }
    }
}

impl Drop for FlowRelease {
    fn drop(&mut self) {
        let _ = self.flow.release_capacity(self.len);
    }
}

impl fmt::Debug for FlowRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowRelease({})", self.len)
    }
}

/// Convert a received body into frames for `stream_id`.
///
/// Always ends with a frame that ends the stream: the last DATA frame,
/// trailers, or a reset. DATA frames come with their [`FlowRelease`]; the
/// body stops being read once the window is used up and nothing has been
/// released. Stops early when `emit` returns false.
pub(crate) async fn relay_body<F>(stream_id: u32, mut body: RecvStream, mut emit: F)
where
    F: FnMut(Http2Frame, Option<FlowRelease>) -> bool,
{
    while let Some(chunk) = body.data().await {
        let data = match chunk {
            Ok(data) => data,
            Err(e) => {
                let reason = e.reason().unwrap_or(Reason::CANCEL);
                tracing::debug!(stream = stream_id, error = %e, "Body aborted");
                emit(
                    Http2Frame::Reset {
                        stream_id,
                        reason: reason.into(),
                    },
                    None,
                );
                return;
            }
        };
        let release = FlowRelease::new(body.flow_control().clone(), data.len());
        let end_stream = body.is_end_stream();
        let frame = Http2Frame::Data {
            stream_id,
            data,
            end_stream,
        };
        if !emit(frame, Some(release)) || end_stream {
            return;
        }
    }

    let last = match body.trailers().await {
        Ok(Some(fields)) => Http2Frame::Headers {
            stream_id,
            headers: Http2Headers::trailers(fields),
            end_stream: true,
        },
        Ok(None) => Http2Frame::Data {
            stream_id,
            data: bytes::Bytes::new(),
            end_stream: true,
        },
        Err(e) => Http2Frame::Reset {
            stream_id,
            reason: e.reason().unwrap_or(Reason::CANCEL).into(),
        },
    };
    emit(last, None);
}
