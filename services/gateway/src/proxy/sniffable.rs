//! Buffered, replayable connection wrapper.
//!
//! `SniffableConn` lets a sniffer look at an arbitrary prefix of a live
//! socket without consuming it. In sniffing mode every read is also appended
//! to a pooled buffer. [`SniffableConn::reset`] leaves sniffing mode and
//! replays `buf[off..end]` to the next reader before falling through to the
//! socket again.
//!
//! ```text
//!  buf: [ consumed | replay ........ | free tail ]
//!        0        off               end         capacity
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use super::buffer::{BufferPool, PooledBuf};
use super::stream::{ErrorAxis, StreamStats};
use super::transport::{BoxTransport, Transport};
use crate::error::{GatewayError, Result};

/// A connection whose leading bytes can be inspected and replayed.
pub struct SniffableConn {
    inner: BoxTransport,
    pool: Arc<BufferPool>,
    /// Acquired on first sniff, returned when the connection is dropped.
    buf: Option<PooledBuf>,
    off: usize,
    end: usize,
    sniffing: bool,
    stats: Arc<StreamStats>,
}

impl SniffableConn {
    pub fn new(inner: BoxTransport, pool: Arc<BufferPool>, stats: Arc<StreamStats>) -> Self {
        Self {
            inner,
            pool,
            buf: None,
            off: 0,
            end: 0,
            sniffing: false,
            stats,
        }
    }

    /// Enter sniffing mode with an empty buffer.
    pub fn sniff(&mut self) -> Result<()> {
        self.acquire()?;
        self.off = 0;
        self.end = 0;
        self.sniffing = true;
        Ok(())
    }

    /// Re-enter sniffing mode over the bytes already buffered, so a second
    /// sniffer sees the same prefix the first one did.
    pub fn rewind(&mut self) -> Result<()> {
        self.acquire()?;
        self.off = 0;
        self.sniffing = true;
        Ok(())
    }

    fn acquire(&mut self) -> Result<()> {
        if self.buf.is_none() {
            self.buf = Some(self.pool.get()?);
        }
        Ok(())
    }

    /// Perform exactly one read from the socket into the free tail.
    ///
    /// Fails with [`GatewayError::ShortBuffer`] when the buffer is already
    /// full and [`GatewayError::ClosedDuringSniff`] when the peer sent EOF.
    pub async fn fill(&mut self) -> Result<usize> {
        if !self.sniffing && self.off >= self.end {
            self.off = 0;
            self.end = 0;
        }
        self.acquire()?;

        let Self {
            inner,
            buf,
            end,
            stats,
            ..
        } = self;
        let Some(buf) = buf.as_mut() else {
            return Err(GatewayError::PoolExhausted);
        };
        if *end >= buf.len() {
            return Err(GatewayError::ShortBuffer {
                capacity: buf.len(),
            });
        }

        let n = match inner.read(&mut buf[*end..]).await {
            Ok(n) => n,
            Err(err) => {
                stats.record_error(ErrorAxis::Read, &err);
                return Err(err.into());
            }
        };
        if n == 0 {
            return Err(GatewayError::ClosedDuringSniff);
        }
        *end += n;
        stats.record_sent(n);
        Ok(n)
    }

    /// Fill until at least `n` bytes are buffered.
    pub async fn fill_to(&mut self, n: usize) -> Result<()> {
        if n > self.capacity() {
            return Err(GatewayError::ShortBuffer {
                capacity: self.capacity(),
            });
        }
        while self.end < n {
            self.fill().await?;
        }
        Ok(())
    }

    /// Leave sniffing mode and replay `buf[off..end]` before direct reads.
    pub fn reset(&mut self, off: usize) {
        self.sniffing = false;
        self.off = off.min(self.end);
        if self.off == self.end {
            self.off = 0;
            self.end = 0;
        }
    }

    /// Drop all buffered bytes and leave sniffing mode.
    pub fn clean(&mut self) {
        self.sniffing = false;
        self.off = 0;
        self.end = 0;
    }

    /// Everything captured since sniffing began.
    pub fn sniffed(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.end],
            None => &[],
        }
    }

    /// Bytes still waiting to be replayed.
    pub fn buffered(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[self.off..self.end],
            None => &[],
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf
            .as_ref()
            .map_or(self.pool.buffer_size(), |buf| buf.len())
    }

    pub fn is_sniffing(&self) -> bool {
        self.sniffing
    }

    pub fn get_ref(&self) -> &dyn Transport {
        &*self.inner
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }
}

impl fmt::Debug for SniffableConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniffableConn")
            .field("off", &self.off)
            .field("end", &self.end)
            .field("sniffing", &self.sniffing)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for SniffableConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.sniffing && this.off < this.end {
            if let Some(buf) = &this.buf {
                let n = out.remaining().min(this.end - this.off);
                out.put_slice(&buf[this.off..this.off + n]);
                this.off += n;
                if this.off >= this.end {
                    this.off = 0;
                    this.end = 0;
                }
                return Poll::Ready(Ok(()));
            }
        }

        let before = out.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, out) {
            Poll::Ready(Ok(())) => {
                let read = &out.filled()[before..];
                if this.sniffing && !read.is_empty() {
                    let Some(buf) = this.buf.as_mut() else {
                        return Poll::Ready(Err(GatewayError::PoolExhausted.into()));
                    };
                    if this.end + read.len() > buf.len() {
                        return Poll::Ready(Err(GatewayError::ShortBuffer {
                            capacity: buf.len(),
                        }
                        .into()));
                    }
                    buf[this.end..this.end + read.len()].copy_from_slice(read);
                    this.end += read.len();
                }
                this.stats.record_sent(read.len());
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                this.stats.record_error(ErrorAxis::Read, &err);
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for SniffableConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                this.stats.record_rcvd(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(err)) => {
                this.stats.record_error(ErrorAxis::Write, &err);
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Transport for SniffableConn {
    /// The raw socket is only exposed once nothing is left to replay.
    fn tcp(&self) -> Option<&TcpStream> {
        if self.sniffing || self.off < self.end {
            return None;
        }
        self.inner.tcp()
    }

    fn pending(&self) -> &[u8] {
        if self.sniffing {
            return &[];
        }
        self.buffered()
    }

    fn consume_pending(&mut self, n: usize) {
        if self.sniffing {
            return;
        }
        self.off = (self.off + n).min(self.end);
        if self.off >= self.end {
            self.off = 0;
            self.end = 0;
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::stream::next_stream_id;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn wrap(pool: &Arc<BufferPool>) -> (SniffableConn, DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let conn = SniffableConn::new(
            Box::new(a),
            Arc::clone(pool),
            StreamStats::new(next_stream_id()),
        );
        (conn, b)
    }

    #[tokio::test]
    async fn test_replay_then_live_bytes() {
        let pool = BufferPool::new(1024, 4);
        let (mut conn, mut peer) = wrap(&pool);

        peer.write_all(b"hello ").await.unwrap();
        conn.sniff().unwrap();
        conn.fill_to(6).await.unwrap();
        assert_eq!(conn.sniffed(), b"hello ");
        conn.reset(0);

        peer.write_all(b"world").await.unwrap();
        drop(peer);

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_reset_mid_buffer_skips_header() {
        let pool = BufferPool::new(1024, 4);
        let (mut conn, mut peer) = wrap(&pool);

        peer.write_all(b"HDRpayload").await.unwrap();
        drop(peer);
        conn.sniff().unwrap();
        conn.fill_to(10).await.unwrap();
        conn.reset(3);
        assert_eq!(conn.pending(), b"payload");

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn test_reads_while_sniffing_are_captured() {
        let pool = BufferPool::new(1024, 4);
        let (mut conn, mut peer) = wrap(&pool);

        peer.write_all(b"abcdef").await.unwrap();
        conn.sniff().unwrap();
        let mut head = [0u8; 6];
        conn.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"abcdef");
        assert_eq!(conn.sniffed(), b"abcdef");

        conn.reset(0);
        let mut again = [0u8; 6];
        conn.read_exact(&mut again).await.unwrap();
        assert_eq!(&again, b"abcdef");
    }

    #[tokio::test]
    async fn test_rewind_keeps_prefix() {
        let pool = BufferPool::new(1024, 4);
        let (mut conn, mut peer) = wrap(&pool);

        peer.write_all(b"\x05\x01\x00").await.unwrap();
        conn.sniff().unwrap();
        conn.fill().await.unwrap();
        conn.reset(0);
        conn.rewind().unwrap();
        conn.fill_to(3).await.unwrap();
        assert_eq!(conn.sniffed(), b"\x05\x01\x00");
    }

    #[tokio::test]
    async fn test_short_buffer_is_deterministic() {
        let pool = BufferPool::new(8, 1);
        let (mut conn, mut peer) = wrap(&pool);

        peer.write_all(&[0x16; 32]).await.unwrap();
        conn.sniff().unwrap();

        assert!(matches!(
            conn.fill_to(16).await,
            Err(GatewayError::ShortBuffer { capacity: 8 })
        ));
        conn.fill_to(8).await.unwrap();
        assert!(matches!(
            conn.fill().await,
            Err(GatewayError::ShortBuffer { capacity: 8 })
        ));
        assert_eq!(conn.sniffed().len(), 8);
    }

    #[tokio::test]
    async fn test_eof_during_fill() {
        let pool = BufferPool::new(64, 1);
        let (mut conn, peer) = wrap(&pool);
        drop(peer);

        conn.sniff().unwrap();
        assert!(matches!(
            conn.fill().await,
            Err(GatewayError::ClosedDuringSniff)
        ));
    }

    #[tokio::test]
    async fn test_buffer_returned_once_on_drop() {
        let pool = BufferPool::bounded(64, 1);
        let (mut conn, _peer) = wrap(&pool);

        conn.sniff().unwrap();
        conn.sniff().unwrap();
        assert_eq!(pool.outstanding(), 1);

        let (mut second, _peer2) = wrap(&pool);
        assert!(matches!(second.sniff(), Err(GatewayError::PoolExhausted)));

        drop(conn);
        assert_eq!(pool.outstanding(), 0);
        second.sniff().unwrap();
        assert_eq!(pool.stats().reuses, 1);
    }

    #[tokio::test]
    async fn test_counters_track_wire_bytes() {
        let pool = BufferPool::new(1024, 1);
        let (mut conn, mut peer) = wrap(&pool);
        let stats = Arc::clone(conn.stats());

        peer.write_all(b"ping").await.unwrap();
        conn.sniff().unwrap();
        conn.fill_to(4).await.unwrap();
        conn.reset(0);

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(b"pong!").await.unwrap();

        // Replayed bytes are not counted twice.
        assert_eq!(stats.sent_bytes(), 4);
        assert_eq!(stats.rcvd_bytes(), 5);
    }
}
