//! Bidirectional proxy loop.
//!
//! Two halves run concurrently until both have finished:
//!
//! - from client: accepted → dialed
//! - to client: dialed → accepted
//!
//! A half that reaches clean EOF half-closes its destination and leaves the
//! other half running. A half that fails records the error on its axis and
//! aborts the other half; the accepted socket is then closed with RST.
//!
//! When both ends are raw TCP sockets on Linux the halves use `splice(2)`.
//! Otherwise each half copies through a pooled buffer with an idle read
//! timeout refreshed before every read.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::buffer::BufferPool;
use super::cancelled;
use super::stream::{is_clean_close, ErrorAxis, Stream, StreamStats};
use super::transport::{can_splice, BoxTransport};

/// Idle bound on each buffered read.
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Direction of one proxy half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Half {
    /// Accepted socket → dialed socket.
    FromClient,
    /// Dialed socket → accepted socket.
    ToClient,
}

impl Half {
    pub(crate) fn read_axis(self) -> ErrorAxis {
        match self {
            Self::FromClient => ErrorAxis::Read,
            Self::ToClient => ErrorAxis::ProxyRead,
        }
    }

    pub(crate) fn write_axis(self) -> ErrorAxis {
        match self {
            Self::FromClient => ErrorAxis::ProxyWrite,
            Self::ToClient => ErrorAxis::Write,
        }
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pub(crate) fn record(self, stats: &StreamStats, n: usize) {
        match self {
            Self::FromClient => stats.record_sent(n),
            Self::ToClient => stats.record_rcvd(n),
        }
    }

    /// Claim the half-close this direction sends on clean EOF.
    pub(crate) fn claim_close(self, stats: &StreamStats) -> bool {
        match self {
            Self::FromClient => stats.claim_server_close(),
            Self::ToClient => stats.claim_client_close(),
        }
    }
}

/// Outcome of a finished proxy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProxySummary {
    pub sent_bytes: u64,
    pub rcvd_bytes: u64,
    pub spliced: bool,
    /// A half failed and the accepted side was reset.
    pub reset: bool,
}

impl Stream {
    /// Proxy this stream to `dialed` until both directions finish.
    ///
    /// Errors are recorded on the stream's error axes rather than returned.
    pub async fn proxy_to(self, dialed: BoxTransport, copy_pool: &Arc<BufferPool>) -> ProxySummary {
        self.proxy_to_with_idle(dialed, copy_pool, IDLE_READ_TIMEOUT)
            .await
    }

    pub async fn proxy_to_with_idle(
        self,
        mut dialed: BoxTransport,
        copy_pool: &Arc<BufferPool>,
        idle: Duration,
    ) -> ProxySummary {
        let Stream { meta, mut conn } = self;
        let stats = Arc::clone(&meta.stats);
        let stream_id = meta.id;

        // Bytes the sniffer buffered go out first so the raw socket is
        // drained and splice can take over.
        let pending = conn.pending().len();
        let mut failed = false;
        let mut spliced = false;
        if pending > 0 {
            let buffered = conn.pending();
            match dialed.write_all(buffered).await {
                Ok(()) => conn.consume_pending(pending),
                Err(err) => {
                    stats.record_error(ErrorAxis::ProxyWrite, &err);
                    failed = true;
                }
            }
        }

        if !failed {
            if can_splice(&*conn, &*dialed) {
                let (client, upstream) = (conn.tcp(), dialed.tcp());
                if let (Some(client), Some(upstream)) = (client, upstream) {
                    spliced = true;
                    failed = splice_pair(client, upstream, &stats).await;
                }
            } else {
                let (c, d, f) = copy_pair(conn, dialed, copy_pool, &stats, idle).await;
                conn = c;
                dialed = d;
                failed = f;
            }
        }

        let stream = Stream { meta, conn };
        if failed {
            if let Err(err) = stream.reset() {
                warn!(stream_id, error = %err, "failed to arm RST on close");
            }
        } else if let Err(err) = stream.close().await {
            debug!(stream_id, error = %err, "close after proxy failed");
        }
        drop(dialed);

        let summary = ProxySummary {
            sent_bytes: stats.sent_bytes(),
            rcvd_bytes: stats.rcvd_bytes(),
            spliced,
            reset: failed,
        };
        debug!(stream_id, ?summary, "proxy loop finished");
        summary
    }
}

#[cfg(target_os = "linux")]
async fn splice_pair(client: &TcpStream, upstream: &TcpStream, stats: &StreamStats) -> bool {
    use super::splice::{splice_half, SpliceError};

    let (abort_tx, abort_rx) = watch::channel(false);

    let settle = |half: Half, result: Result<u64, SpliceError>| -> bool {
        let (axis, err) = match result {
            Ok(_) | Err(SpliceError::Aborted) => return false,
            Err(SpliceError::Read(err)) => (half.read_axis(), err),
            Err(SpliceError::Write(err)) => (half.write_axis(), err),
        };
        fail(stats, &abort_tx, axis, &err)
    };

    let abort_up = abort_rx.clone();
    let up = async {
        let result = splice_half(client, upstream, Half::FromClient, stats, abort_up).await;
        settle(Half::FromClient, result)
    };
    let down = async {
        let result = splice_half(upstream, client, Half::ToClient, stats, abort_rx).await;
        settle(Half::ToClient, result)
    };
    let (up, down) = tokio::join!(up, down);
    up || down
}

#[cfg(not(target_os = "linux"))]
async fn splice_pair(_client: &TcpStream, _upstream: &TcpStream, _stats: &StreamStats) -> bool {
    false
}

async fn copy_pair(
    conn: BoxTransport,
    dialed: BoxTransport,
    pool: &Arc<BufferPool>,
    stats: &StreamStats,
    idle: Duration,
) -> (BoxTransport, BoxTransport, bool) {
    let (mut client_rd, mut client_wr) = tokio::io::split(conn);
    let (mut dialed_rd, mut dialed_wr) = tokio::io::split(dialed);
    let (abort_tx, _) = watch::channel(false);

    let (up, down) = tokio::join!(
        copy_half(&mut client_rd, &mut dialed_wr, Half::FromClient, pool, stats, idle, &abort_tx),
        copy_half(&mut dialed_rd, &mut client_wr, Half::ToClient, pool, stats, idle, &abort_tx),
    );

    (
        client_rd.unsplit(client_wr),
        dialed_rd.unsplit(dialed_wr),
        up || down,
    )
}

/// Record a non-clean error and stop the companion half. Returns whether
/// the error counts as a failure.
fn fail(stats: &StreamStats, abort: &watch::Sender<bool>, axis: ErrorAxis, err: &io::Error) -> bool {
    if is_clean_close(err) {
        return false;
    }
    stats.record_error(axis, err);
    abort.send_replace(true);
    true
}

/// Copy one direction through a pooled buffer. Returns true on failure.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    half: Half,
    pool: &Arc<BufferPool>,
    stats: &StreamStats,
    idle: Duration,
    abort_tx: &watch::Sender<bool>,
) -> bool
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut abort = abort_tx.subscribe();
    let mut buf = match pool.get() {
        Ok(buf) => buf,
        Err(err) => return fail(stats, abort_tx, half.read_axis(), &err.into()),
    };

    loop {
        let read = tokio::select! {
            biased;
            _ = cancelled(&mut abort) => return false,
            r = timeout(idle, reader.read(&mut buf[..])) => r,
        };
        let n = match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(err)) if is_clean_close(&err) => break,
            Ok(Err(err)) => return fail(stats, abort_tx, half.read_axis(), &err),
            Err(_) => {
                let err = io::Error::new(io::ErrorKind::TimedOut, format!("idle for {idle:?}"));
                return fail(stats, abort_tx, half.read_axis(), &err);
            }
        };

        let written = tokio::select! {
            biased;
            _ = cancelled(&mut abort) => return false,
            r = writer.write_all(&buf[..n]) => r,
        };
        if let Err(err) = written {
            return fail(stats, abort_tx, half.write_axis(), &err);
        }
    }
    drop(buf);

    if half.claim_close(stats) {
        if let Err(err) = writer.shutdown().await {
            return fail(stats, abort_tx, half.write_axis(), &err);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::stream::{next_stream_id, StreamMeta};
    use crate::proxy::transport::Transport;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn stream_over(conn: BoxTransport) -> (Stream, Arc<StreamStats>) {
        let stats = StreamStats::new(next_stream_id());
        let meta = StreamMeta::new(Arc::clone(&stats));
        (Stream::new(meta, conn), stats)
    }

    /// Fails every read with a reset.
    struct ResettingTransport;

    impl AsyncRead for ResettingTransport {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResettingTransport {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl Transport for ResettingTransport {}

    #[tokio::test]
    async fn test_half_close_keeps_other_direction() {
        let (accepted, mut client) = tokio::io::duplex(1024);
        let (dialed, mut upstream) = tokio::io::duplex(1024);
        let (stream, stats) = stream_over(Box::new(accepted));

        let proxy = tokio::spawn(async move {
            stream.proxy_to(Box::new(dialed), &BufferPool::copy()).await
        });

        // Upstream answers and closes; the client still sees all bytes then EOF.
        upstream.write_all(b"response").await.unwrap();
        upstream.shutdown().await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"response");
        assert!(stats.client_closed());

        // The client can still send after receiving FIN.
        client.write_all(b"late").await.unwrap();
        client.shutdown().await.unwrap();
        let mut late = Vec::new();
        upstream.read_to_end(&mut late).await.unwrap();
        assert_eq!(late, b"late");

        let summary = proxy.await.unwrap();
        assert!(!summary.spliced);
        assert!(!summary.reset);
        assert!(stats.is_closed());
        assert!(stats.error(ErrorAxis::Read).is_none());
    }

    #[tokio::test]
    async fn test_upstream_reset_recorded_on_proxy_read() {
        let (accepted, mut client) = tokio::io::duplex(1024);
        let (stream, stats) = stream_over(Box::new(accepted));

        let summary = stream
            .proxy_to(Box::new(ResettingTransport), &BufferPool::copy())
            .await;
        assert!(summary.reset);
        assert_eq!(
            stats.error(ErrorAxis::ProxyRead).unwrap().kind,
            "ConnectionReset"
        );
        assert!(stats.error(ErrorAxis::Read).is_none());
        // Torn down without a half-close toward the client.
        assert!(stats.is_closed());
        assert!(!stats.client_closed());

        // Accepted side is closed once the loop returns.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_read() {
        let (accepted, _client) = tokio::io::duplex(1024);
        let (dialed, _upstream) = tokio::io::duplex(1024);
        let (stream, stats) = stream_over(Box::new(accepted));

        let summary = stream
            .proxy_to_with_idle(Box::new(dialed), &BufferPool::copy(), Duration::from_millis(30))
            .await;
        assert!(summary.reset);
        let read_timed_out = stats
            .error(ErrorAxis::Read)
            .or(stats.error(ErrorAxis::ProxyRead))
            .map(|e| e.kind.clone());
        assert_eq!(read_timed_out.as_deref(), Some("TimedOut"));
    }

    #[tokio::test]
    async fn test_copy_buffers_returned() {
        let pool = BufferPool::bounded(1024, 2);
        let (accepted, mut client) = tokio::io::duplex(1024);
        let (dialed, mut upstream) = tokio::io::duplex(1024);
        let (stream, _stats) = stream_over(Box::new(accepted));

        let proxy_pool = Arc::clone(&pool);
        let proxy = tokio::spawn(async move { stream.proxy_to(Box::new(dialed), &proxy_pool).await });

        client.shutdown().await.unwrap();
        upstream.shutdown().await.unwrap();
        proxy.await.unwrap();
        assert_eq!(pool.outstanding(), 0);
    }
}
