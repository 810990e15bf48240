//! Peeking at the first client bytes without consuming them.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;
/// Major version byte shared by SSL 3.0 and every TLS version.
const TLS_MAJOR_VERSION: u8 = 0x03;
/// Bytes needed to classify: content type plus two version bytes.
const SNIFF_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Tls,
    Plaintext,
}

/// Classify the start of a stream. `None` means more bytes are needed.
pub fn classify(prefix: &[u8]) -> Option<Sniffed> {
    match prefix {
        [] => None,
        [first, ..] if *first != TLS_HANDSHAKE => Some(Sniffed::Plaintext),
        [_] => None,
        [_, major, ..] if *major != TLS_MAJOR_VERSION => Some(Sniffed::Plaintext),
        [_, _] => None,
        [_, _, minor, ..] if *minor <= 0x04 => Some(Sniffed::Tls),
        _ => Some(Sniffed::Plaintext),
    }
}

/// Stream that replays a buffered prefix before reading from the inner stream.
pub struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn into_inner(self) -> (Bytes, T) {
        (self.prefix, self.inner)
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Read until the stream can be classified, EOF, or `timeout` of silence.
///
/// A client that sends nothing within `timeout` is treated as plaintext so
/// server-speaks-first protocols can still be forwarded.
pub async fn sniff<T>(mut io: T, timeout: Duration) -> io::Result<(Rewind<T>, Sniffed)>
where
    T: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(512);
    let deadline = tokio::time::Instant::now() + timeout;

    let kind = loop {
        if let Some(kind) = classify(&buf) {
            break kind;
        }
        match tokio::time::timeout_at(deadline, io.read_buf(&mut buf)).await {
            Ok(Ok(0)) => break Sniffed::Plaintext,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::debug!(buffered = buf.len(), "Sniff timed out, assuming plaintext");
                break Sniffed::Plaintext;
            }
        }
    };
    debug_assert!(kind == Sniffed::Plaintext || buf.len() >= SNIFF_LEN);

    Ok((Rewind::new(buf.freeze(), io), kind))
}
