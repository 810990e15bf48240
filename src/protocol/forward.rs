//! Opaque byte relay.

use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::Result;
use crate::negotiation::{Channel, ConnectionContext, Inbox};
use crate::protocol::{BoxFuture, BoxedIo, Message, ProtocolHandler};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// Copies bytes between its own I/O and the peer side, honouring half-close.
#[derive(Debug, Clone, Copy)]
pub struct ForwardHandler {
    side: Side,
}

impl ForwardHandler {
    pub fn client_side() -> Self {
        Self { side: Side::Client }
    }

    pub fn server_side() -> Self {
        Self { side: Side::Server }
    }

    fn peer<'a>(&self, ctx: &'a ConnectionContext) -> &'a Channel {
        match self.side {
            Side::Client => ctx.server(),
            Side::Server => ctx.client(),
        }
    }
}

impl ProtocolHandler for ForwardHandler {
    fn run(
        self: Box<Self>,
        io: BoxedIo,
        ctx: Arc<ConnectionContext>,
        inbox: Inbox,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { self.relay(io, &ctx, inbox).await })
    }
}

impl ForwardHandler {
    async fn relay(&self, mut io: BoxedIo, ctx: &ConnectionContext, mut inbox: Inbox) -> Result<()> {
        let peer = self.peer(ctx);
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut reading = true;
        let mut writing = true;
        let mut relayed = 0u64;

        while reading || writing {
            buf.reserve(READ_CHUNK);
            tokio::select! {
                read = io.read_buf(&mut buf), if reading => {
                    if read? == 0 {
                        reading = false;
                        peer.write(Message::Eof)?;
                    } else {
                        relayed += buf.len() as u64;
                        peer.write(Message::Bytes(buf.split().freeze()))?;
                    }
                }
                message = inbox.recv(), if writing => match message {
                    Some(Message::Bytes(bytes)) => io.write_all(&bytes).await?,
                    Some(Message::Eof) => {
                        writing = false;
                        io.shutdown().await?;
                    }
                    Some(other) => {
                        tracing::warn!(kind = other.kind(), "Unexpected message on forward relay");
                    }
                    None => break,
                },
            }
        }

        tracing::debug!(side = ?self.side, bytes = relayed, "Forward relay finished");
        Ok(())
    }
}
