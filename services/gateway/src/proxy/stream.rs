//! Per-connection metadata and lifecycle.
//!
//! A [`Stream`] pairs the classified metadata of one logical connection with
//! the transport it arrived on. Counters, error axes and close flags live in
//! [`StreamStats`], which is shared with the active-stream table so the debug
//! surface can read them while the connection is still running.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use super::router::ListenerConfig;
use super::sniff::{connect, socks5};
use super::transport::{reset_on_close, BoxTransport, Transport};

/// Process-wide stream identifier.
pub type StreamId = u64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new, never reused stream id.
pub fn next_stream_id() -> StreamId {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Listener protocol or detected stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Raw TCP with a static destination.
    Tcp,
    Tls,
    /// TLS terminated locally.
    Https,
    Http,
    H2,
    Socks5,
    Iptables,
    IptablesIn,
    Connect,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Https => "https",
            Self::Http => "http",
            Self::H2 => "h2",
            Self::Socks5 => "socks5",
            Self::Iptables => "iptables",
            Self::IptablesIn => "iptables-in",
            Self::Connect => "connect",
        }
    }

    /// Listener protocols whose destination comes from the client or the
    /// kernel. Unrouted streams on these fall back to the default route.
    pub fn routes_by_destination(&self) -> bool {
        matches!(
            self,
            Self::Socks5 | Self::Iptables | Self::IptablesIn | Self::Connect
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "" => Ok(Self::Tcp),
            "tls" => Ok(Self::Tls),
            "https" => Ok(Self::Https),
            "http" => Ok(Self::Http),
            "h2" => Ok(Self::H2),
            "socks5" | "socks" => Ok(Self::Socks5),
            "iptables" => Ok(Self::Iptables),
            "iptables-in" => Ok(Self::IptablesIn),
            "connect" => Ok(Self::Connect),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// Which physical socket and direction produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAxis {
    /// Reading from the accepted socket.
    Read,
    /// Writing to the accepted socket.
    Write,
    /// Reading from the dialed socket.
    ProxyRead,
    /// Writing to the dialed socket.
    ProxyWrite,
}

/// First error recorded on one axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamError {
    pub kind: String,
    pub message: String,
}

impl From<&io::Error> for StreamError {
    fn from(err: &io::Error) -> Self {
        Self {
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// EOF and a peer that went away mid-write end a direction cleanly.
pub fn is_clean_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe
    )
}

#[derive(Debug, Default, Clone)]
struct StreamLabels {
    kind: Option<Protocol>,
    dest: Option<String>,
    peer: Option<SocketAddr>,
    egress: bool,
}

/// Shared counters and state for one stream.
#[derive(Debug)]
pub struct StreamStats {
    id: StreamId,
    opened: Instant,
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    rcvd_bytes: AtomicU64,
    rcvd_packets: AtomicU64,
    /// Millis since open, 0 until the first event.
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    read_err: OnceLock<StreamError>,
    write_err: OnceLock<StreamError>,
    proxy_read_err: OnceLock<StreamError>,
    proxy_write_err: OnceLock<StreamError>,
    client_close: AtomicBool,
    server_close: AtomicBool,
    closed: AtomicBool,
    labels: Mutex<StreamLabels>,
}

impl StreamStats {
    pub fn new(id: StreamId) -> Arc<Self> {
        Arc::new(Self {
            id,
            opened: Instant::now(),
            sent_bytes: AtomicU64::new(0),
            sent_packets: AtomicU64::new(0),
            rcvd_bytes: AtomicU64::new(0),
            rcvd_packets: AtomicU64::new(0),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            read_err: OnceLock::new(),
            write_err: OnceLock::new(),
            proxy_read_err: OnceLock::new(),
            proxy_write_err: OnceLock::new(),
            client_close: AtomicBool::new(false),
            server_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            labels: Mutex::new(StreamLabels::default()),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    fn elapsed_ms(&self) -> u64 {
        (self.opened.elapsed().as_millis() as u64).max(1)
    }

    /// Bytes read from the accepted side, headed for the dialed side.
    pub fn record_sent(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.last_read_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Bytes written to the accepted side, coming from the dialed side.
    pub fn record_rcvd(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.rcvd_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.rcvd_packets.fetch_add(1, Ordering::Relaxed);
        self.last_write_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    pub fn rcvd_bytes(&self) -> u64 {
        self.rcvd_bytes.load(Ordering::Relaxed)
    }

    pub fn rcvd_packets(&self) -> u64 {
        self.rcvd_packets.load(Ordering::Relaxed)
    }

    /// Record `err` on `axis`. Clean closes are ignored and only the first
    /// error per axis is kept. Returns true if the error was stored.
    pub fn record_error(&self, axis: ErrorAxis, err: &io::Error) -> bool {
        if is_clean_close(err) {
            return false;
        }
        self.slot(axis).set(StreamError::from(err)).is_ok()
    }

    pub fn error(&self, axis: ErrorAxis) -> Option<&StreamError> {
        self.slot(axis).get()
    }

    fn slot(&self, axis: ErrorAxis) -> &OnceLock<StreamError> {
        match axis {
            ErrorAxis::Read => &self.read_err,
            ErrorAxis::Write => &self.write_err,
            ErrorAxis::ProxyRead => &self.proxy_read_err,
            ErrorAxis::ProxyWrite => &self.proxy_write_err,
        }
    }

    /// Claim the half-close toward the accepted side. True only the first time.
    pub fn claim_client_close(&self) -> bool {
        !self.client_close.swap(true, Ordering::AcqRel)
    }

    /// Claim the half-close toward the dialed side. True only the first time.
    pub fn claim_server_close(&self) -> bool {
        !self.server_close.swap(true, Ordering::AcqRel)
    }

    /// Claim the full close. True only the first time.
    pub fn claim_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn client_closed(&self) -> bool {
        self.client_close.load(Ordering::Acquire)
    }

    pub fn server_closed(&self) -> bool {
        self.server_close.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn open_for(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Time since the accepted side last delivered bytes.
    pub fn since_last_read(&self) -> Option<Duration> {
        self.since(self.last_read_ms.load(Ordering::Relaxed))
    }

    /// Time since bytes were last written to the accepted side.
    pub fn since_last_write(&self) -> Option<Duration> {
        self.since(self.last_write_ms.load(Ordering::Relaxed))
    }

    fn since(&self, at_ms: u64) -> Option<Duration> {
        if at_ms == 0 {
            return None;
        }
        Some(self.opened.elapsed().saturating_sub(Duration::from_millis(at_ms)))
    }

    pub(crate) fn label(&self, meta: &StreamMeta) {
        if let Ok(mut labels) = self.labels.lock() {
            labels.kind = meta.kind;
            labels.dest = meta.dest.clone();
            labels.peer = meta.peer_addr;
            labels.egress = meta.egress;
        }
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let labels = self
            .labels
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default();
        StreamSnapshot {
            id: self.id,
            kind: labels.kind,
            dest: labels.dest,
            peer: labels.peer,
            egress: labels.egress,
            open_ms: self.open_for().as_millis() as u64,
            sent_bytes: self.sent_bytes(),
            sent_packets: self.sent_packets(),
            rcvd_bytes: self.rcvd_bytes(),
            rcvd_packets: self.rcvd_packets(),
            since_last_read_ms: self.since_last_read().map(|d| d.as_millis() as u64),
            since_last_write_ms: self.since_last_write().map(|d| d.as_millis() as u64),
            read_err: self.read_err.get().cloned(),
            write_err: self.write_err.get().cloned(),
            proxy_read_err: self.proxy_read_err.get().cloned(),
            proxy_write_err: self.proxy_write_err.get().cloned(),
            client_close: self.client_closed(),
            server_close: self.server_closed(),
            closed: self.is_closed(),
        }
    }
}

/// Serializable view of a stream for debug endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub id: StreamId,
    pub kind: Option<Protocol>,
    pub dest: Option<String>,
    pub peer: Option<SocketAddr>,
    pub egress: bool,
    pub open_ms: u64,
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub rcvd_bytes: u64,
    pub rcvd_packets: u64,
    pub since_last_read_ms: Option<u64>,
    pub since_last_write_ms: Option<u64>,
    pub read_err: Option<StreamError>,
    pub write_err: Option<StreamError>,
    pub proxy_read_err: Option<StreamError>,
    pub proxy_write_err: Option<StreamError>,
    pub client_close: bool,
    pub server_close: bool,
    pub closed: bool,
}

/// Reply a sniffer owes the client once the dial outcome is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostDial {
    Socks5Reply,
    ConnectReply,
}

/// Classified metadata for one stream.
pub struct StreamMeta {
    pub id: StreamId,
    /// Detected (or assigned) protocol.
    pub kind: Option<Protocol>,
    /// Destination as `host:port`.
    pub dest: Option<String>,
    pub dest_addr: Option<SocketAddr>,
    /// Local address of the accepted socket.
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// Locally originated, captured traffic.
    pub egress: bool,
    /// Resolved listener or route config.
    pub listener: Option<Arc<ListenerConfig>>,
    pub post_dial: Option<PostDial>,
    pub stats: Arc<StreamStats>,
}

impl StreamMeta {
    pub fn new(stats: Arc<StreamStats>) -> Self {
        Self {
            id: stats.id(),
            kind: None,
            dest: None,
            dest_addr: None,
            local_addr: None,
            peer_addr: None,
            egress: false,
            listener: None,
            post_dial: None,
            stats,
        }
    }

    /// Set the destination, parsing it as a socket address when possible.
    pub fn set_dest(&mut self, dest: impl Into<String>) {
        let dest = dest.into();
        self.dest_addr = dest.parse().ok();
        self.dest = Some(dest);
    }
}

impl fmt::Debug for StreamMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMeta")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dest", &self.dest)
            .field("peer_addr", &self.peer_addr)
            .field("egress", &self.egress)
            .finish_non_exhaustive()
    }
}

/// A classified connection ready for a handler or the proxy loop.
pub struct Stream {
    pub meta: StreamMeta,
    pub(crate) conn: BoxTransport,
}

impl Stream {
    pub fn new(meta: StreamMeta, conn: BoxTransport) -> Self {
        meta.stats.label(&meta);
        Self { meta, conn }
    }

    pub fn id(&self) -> StreamId {
        self.meta.id
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.meta.stats
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.conn
    }

    pub fn transport_mut(&mut self) -> &mut BoxTransport {
        &mut self.conn
    }

    /// Send the reply a sniffer deferred until the dial outcome was known.
    /// Runs at most once; later calls are no-ops.
    pub async fn post_dial(&mut self, outcome: Result<(), &io::Error>) -> io::Result<()> {
        let Some(hook) = self.meta.post_dial.take() else {
            return Ok(());
        };
        let reply = match (hook, outcome) {
            (PostDial::Socks5Reply, Ok(())) => {
                socks5::reply(socks5::REPLY_SUCCEEDED, self.meta.local_addr)
            }
            (PostDial::Socks5Reply, Err(err)) => socks5::reply(socks5::reply_code(err), None),
            (PostDial::ConnectReply, Ok(())) => connect::ESTABLISHED.to_vec(),
            (PostDial::ConnectReply, Err(_)) => connect::BAD_GATEWAY.to_vec(),
        };
        self.conn.write_all(&reply).await?;
        self.conn.flush().await
    }

    /// Half-close toward the accepted side. A second call is a no-op.
    pub async fn close_write(&mut self) -> io::Result<()> {
        if !self.meta.stats.claim_client_close() {
            debug!(stream_id = self.meta.id, "half-close already sent");
            return Ok(());
        }
        self.conn.shutdown().await
    }

    /// Close the stream. Sends FIN only if no half-close was sent before.
    pub async fn close(mut self) -> io::Result<()> {
        if !self.meta.stats.claim_closed() {
            debug!(stream_id = self.meta.id, "stream already closed");
            return Ok(());
        }
        let result = if self.meta.stats.claim_client_close() {
            self.conn.shutdown().await
        } else {
            Ok(())
        };
        drop(self.conn);
        result
    }

    /// Close the stream with RST when the accepted side is a raw TCP socket.
    /// Other transports are dropped without a FIN.
    pub fn reset(self) -> io::Result<()> {
        if !self.meta.stats.claim_closed() {
            debug!(stream_id = self.meta.id, "stream already closed");
            return Ok(());
        }
        match self.conn.tcp() {
            Some(tcp) => reset_on_close(tcp),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("meta", &self.meta).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.conn).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts shutdown calls so FIN emission can be asserted.
    struct CountingTransport {
        inner: tokio::io::DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingTransport {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingTransport {
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
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl Transport for CountingTransport {}

    fn counting_stream() -> (Stream, Arc<AtomicUsize>, tokio::io::DuplexStream) {
        let (inner, peer) = tokio::io::duplex(1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let conn = CountingTransport {
            inner,
            shutdowns: Arc::clone(&shutdowns),
        };
        let meta = StreamMeta::new(StreamStats::new(next_stream_id()));
        (Stream::new(meta, Box::new(conn)), shutdowns, peer)
    }

    #[test]
    fn test_stream_ids_unique() {
        let a = next_stream_id();
        let b = next_stream_id();
        assert!(b > a);
    }

    #[test]
    fn test_protocol_names_round_trip() {
        for p in [
            Protocol::Tcp,
            Protocol::Tls,
            Protocol::Https,
            Protocol::Http,
            Protocol::H2,
            Protocol::Socks5,
            Protocol::Iptables,
            Protocol::IptablesIn,
            Protocol::Connect,
        ] {
            assert_eq!(p.as_str().parse::<Protocol>().unwrap(), p);
        }
        assert_eq!(
            serde_json::to_string(&Protocol::IptablesIn).unwrap(),
            "\"iptables-in\""
        );
        assert!("quic".parse::<Protocol>().is_err());
    }

    #[tokio::test]
    async fn test_double_close_write_sends_one_fin() {
        let (mut stream, shutdowns, _peer) = counting_stream();

        stream.close_write().await.unwrap();
        stream.close_write().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let stats = Arc::clone(stream.stats());
        stream.close().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(stats.is_closed());
    }

    #[tokio::test]
    async fn test_close_without_half_close_sends_fin() {
        let (stream, shutdowns, _peer) = counting_stream();
        stream.close().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_sends_no_fin() {
        let (stream, shutdowns, mut peer) = counting_stream();
        let stats = Arc::clone(stream.stats());

        stream.reset().unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        assert!(stats.is_closed());
        assert!(!stats.client_closed());

        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut peer, &mut rest)
            .await
            .unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_destination_routed_protocols() {
        for p in [
            Protocol::Socks5,
            Protocol::Iptables,
            Protocol::IptablesIn,
            Protocol::Connect,
        ] {
            assert!(p.routes_by_destination(), "{p}");
        }
        for p in [Protocol::Tcp, Protocol::Tls, Protocol::Https, Protocol::H2] {
            assert!(!p.routes_by_destination(), "{p}");
        }
    }

    #[test]
    fn test_counters_monotonic() {
        let stats = StreamStats::new(next_stream_id());
        let mut last = (0, 0);
        for n in [3usize, 0, 17, 1, 4096] {
            stats.record_sent(n);
            stats.record_rcvd(n * 2);
            let now = (stats.sent_bytes(), stats.rcvd_bytes());
            assert!(now.0 >= last.0 && now.1 >= last.1);
            last = now;
        }
        assert_eq!(stats.sent_bytes(), 3 + 17 + 1 + 4096);
        assert_eq!(stats.rcvd_bytes(), 2 * (3 + 17 + 1 + 4096));
        assert_eq!(stats.sent_packets(), 4);
        assert_eq!(stats.rcvd_packets(), 4);
    }

    #[test]
    fn test_error_axes_keep_first_and_skip_clean_close() {
        let stats = StreamStats::new(next_stream_id());

        assert!(!stats.record_error(ErrorAxis::Read, &io::ErrorKind::UnexpectedEof.into()));
        assert!(!stats.record_error(ErrorAxis::Write, &io::ErrorKind::BrokenPipe.into()));
        assert!(stats.record_error(
            ErrorAxis::ProxyRead,
            &io::ErrorKind::ConnectionReset.into()
        ));
        assert!(!stats.record_error(ErrorAxis::ProxyRead, &io::ErrorKind::TimedOut.into()));

        assert!(stats.error(ErrorAxis::Read).is_none());
        assert!(stats.error(ErrorAxis::Write).is_none());
        assert_eq!(
            stats.error(ErrorAxis::ProxyRead).unwrap().kind,
            "ConnectionReset"
        );
        assert!(stats.error(ErrorAxis::ProxyWrite).is_none());
    }
}
