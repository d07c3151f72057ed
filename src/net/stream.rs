//! Byte stream abstraction shared by all transports.
//!
//! Connections arrive as many concrete types (TCP, TLS over TCP, KCP, TLS
//! over KCP, hijacked HTTP upgrades). `RpcStream` erases them behind one
//! reliable bidirectional stream and carries the peer metadata the channel
//! factory needs: the remote endpoint and, for TLS streams, the peer's leaf
//! certificate in DER form.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Object-safe alias for the traits every transport stream provides.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A transport-agnostic byte stream with peer metadata.
pub struct RpcStream {
    io: Box<dyn Io>,
    peer_addr: Option<SocketAddr>,
    peer_certificate: Option<Vec<u8>>,
}

impl RpcStream {
    pub fn new<S: Io + 'static>(io: S) -> Self {
        Self {
            io: Box::new(io),
            peer_addr: None,
            peer_certificate: None,
        }
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Attach the DER bytes of the peer's leaf certificate.
    ///
    /// Empty certificates are discarded so downstream checks can rely on
    /// `peer_certificate()` being `Some` only for a real certificate.
    pub fn with_peer_certificate(mut self, der: Vec<u8>) -> Self {
        if !der.is_empty() {
            self.peer_certificate = Some(der);
        }
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }

    /// Push already-consumed bytes back in front of the stream.
    ///
    /// Used by the HTTP magic-code shortcut, which sniffs the first bytes of
    /// a fresh connection before deciding whether to parse HTTP at all.
    pub fn prepend(&mut self, prefix: Vec<u8>) {
        if prefix.is_empty() {
            return;
        }
        let inner = std::mem::replace(&mut self.io, Box::new(tokio::io::empty()));
        self.io = Box::new(PrefixedStream::new(inner, prefix));
    }
}

impl AsyncRead for RpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// A stream wrapper that replays a sniffed prefix before the inner stream.
pub struct PrefixedStream<S> {
    inner: S,
    buffer: Vec<u8>,
    pos: usize,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            buffer: prefix,
            pos: 0,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Drain the buffered prefix first
        if self.pos < self.buffer.len() {
            let remaining = &self.buffer[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
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
}
