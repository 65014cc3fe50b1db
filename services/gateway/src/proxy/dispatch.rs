//! Accepted-connection dispatch.
//!
//! [`Gateway::handle_accepted_conn`] turns one raw accepted connection into a
//! classified [`Stream`]:
//!
//! 1. register the stream in the active table
//! 2. run the sniffer registered for the listener's protocol, bounded by the
//!    sniff timeout
//! 3. re-resolve the config by sniffed destination (egress protocols fall
//!    back to the default route on a miss), then apply `forward_to`
//! 4. terminate TLS when the listener or route asks for it
//! 5. hand the stream to [`Gateway::handle_stream`]
//!
//! Everything runs under a panic guard; one connection can never take the
//! listener down. Cleanup, counters and the per-connection summary line live
//! in a single finalizer that runs on success, error and panic alike.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, Instrument};

use super::buffer::{BufferPool, PoolStats};
use super::dial::{Dialer, TcpDialer};
use super::router::{ListenerConfig, RouteResolver};
use super::sniff::{SnifferRegistry, SockoptLookup};
use super::sniffable::SniffableConn;
use super::stream::{
    next_stream_id, ErrorAxis, Protocol, Stream, StreamId, StreamMeta, StreamSnapshot,
    StreamStats,
};
use super::tls::{RustlsTerminator, TlsTerminator};
use super::transport::BoxTransport;
use crate::error::{GatewayError, Result};

/// Default bound on one sniff phase.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway-wide gauges and counters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub active: AtomicU64,
    pub total: AtomicU64,
    pub sniff_failed: AtomicU64,
    pub route_failed: AtomicU64,
    pub tls_failed: AtomicU64,
    pub dial_failed: AtomicU64,
    pub handled: AtomicU64,
    pub proxied: AtomicU64,
    pub panics: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
    pub proxy_read_errors: AtomicU64,
    pub proxy_write_errors: AtomicU64,
}

/// Serializable view of [`GatewayStats`] plus pool usage.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatsSnapshot {
    pub active: u64,
    pub total: u64,
    pub sniff_failed: u64,
    pub route_failed: u64,
    pub tls_failed: u64,
    pub dial_failed: u64,
    pub handled: u64,
    pub proxied: u64,
    pub panics: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub proxy_read_errors: u64,
    pub proxy_write_errors: u64,
    pub sniff_pool: PoolStats,
    pub copy_pool: PoolStats,
}

/// Accept dispatcher and shared per-process state.
pub struct Gateway {
    routes: Arc<dyn RouteResolver>,
    sniffers: SnifferRegistry,
    dialer: Arc<dyn Dialer>,
    tls: Arc<dyn TlsTerminator>,
    sniff_pool: Arc<BufferPool>,
    copy_pool: Arc<BufferPool>,
    sniff_timeout: Duration,
    active: Mutex<HashMap<StreamId, Arc<StreamStats>>>,
    stats: GatewayStats,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(routes: Arc<dyn RouteResolver>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            routes,
            sniffers: SnifferRegistry::with_defaults(Arc::new(SockoptLookup)),
            dialer: Arc::new(TcpDialer::new()),
            tls: Arc::new(RustlsTerminator::default()),
            sniff_pool: BufferPool::sniff(),
            copy_pool: BufferPool::copy(),
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            active: Mutex::new(HashMap::new()),
            stats: GatewayStats::default(),
            shutdown,
        }
    }

    pub fn with_sniffers(mut self, sniffers: SnifferRegistry) -> Self {
        self.sniffers = sniffers;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_tls_terminator(mut self, tls: Arc<dyn TlsTerminator>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_pools(mut self, sniff: Arc<BufferPool>, copy: Arc<BufferPool>) -> Self {
        self.sniff_pool = sniff;
        self.copy_pool = copy;
        self
    }

    pub fn with_sniff_timeout(mut self, sniff_timeout: Duration) -> Self {
        self.sniff_timeout = sniff_timeout;
        self
    }

    /// Classify and serve one accepted connection. Never fails and never
    /// panics; the outcome is logged and counted.
    pub async fn handle_accepted_conn(&self, listener: Arc<ListenerConfig>, conn: BoxTransport) {
        let stats = StreamStats::new(next_stream_id());
        let id = stats.id();
        let span = info_span!(
            "conn",
            stream_id = id,
            listener = %listener.address,
            protocol = %listener.protocol,
            peer = ?conn.peer_addr(),
        );
        self.track(&stats);

        let outcome = AssertUnwindSafe(self.accept(listener, conn, Arc::clone(&stats)))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        span.in_scope(|| self.finish(&stats, outcome));
    }

    async fn accept(
        &self,
        listener: Arc<ListenerConfig>,
        conn: BoxTransport,
        stats: Arc<StreamStats>,
    ) -> Result<()> {
        let mut meta = StreamMeta::new(Arc::clone(&stats));
        meta.local_addr = conn.local_addr();
        meta.peer_addr = conn.peer_addr();
        meta.kind = Some(listener.protocol);
        meta.listener = Some(Arc::clone(&listener));
        stats.label(&meta);

        let mut conn = SniffableConn::new(conn, Arc::clone(&self.sniff_pool), Arc::clone(&stats));

        if let Some(sniffer) = self.sniffers.get(listener.protocol) {
            let limit = listener.sniff_timeout.unwrap_or(self.sniff_timeout);
            let kind = match timeout(limit, sniffer.sniff(&mut conn, &mut meta)).await {
                Ok(result) => result?,
                Err(_) => return Err(GatewayError::SniffTimeout(limit)),
            };
            debug!(sniffer = sniffer.name(), kind = %kind, dest = ?meta.dest, "classified");
            meta.kind = Some(kind);
            match self.routes.resolve(&meta) {
                Some(route) => meta.listener = Some(route),
                None if listener.protocol.routes_by_destination() => {
                    if let Some(default) = self.routes.default_listener() {
                        debug!(dest = ?meta.dest, "no route matched, using default");
                        meta.listener = Some(default);
                    }
                }
                None => {}
            }
        }

        let config = meta.listener.clone().unwrap_or_else(|| Arc::clone(&listener));
        if let Some(forward_to) = &config.forward_to {
            meta.set_dest(forward_to.clone());
        }

        let terminate = match (listener.protocol, meta.kind) {
            (Protocol::Https, _) => true,
            (_, Some(Protocol::Tls)) => config.tls.is_some(),
            _ => false,
        };
        let transport: BoxTransport = if terminate {
            let tls = config
                .tls
                .clone()
                .or_else(|| listener.tls.clone())
                .ok_or_else(|| {
                    GatewayError::Misconfigured(format!(
                        "{} terminates TLS without a certificate",
                        listener.address
                    ))
                })?;
            let decrypted = self.tls.accept(conn, tls, self.shutdown.subscribe()).await?;
            meta.kind = Some(Protocol::Https);
            decrypted
        } else {
            Box::new(conn)
        };

        self.handle_stream(Stream::new(meta, transport)).await
    }

    /// Serve a classified stream: an in-process handler if the config has
    /// one, otherwise dial the destination and proxy.
    pub async fn handle_stream(&self, mut stream: Stream) -> Result<()> {
        if stream.meta.listener.is_none() {
            stream.meta.listener = self.routes.default_listener();
        }
        let config = stream.meta.listener.clone();

        if let Some(handler) = config.as_ref().and_then(|c| c.handler.clone()) {
            // No real dial happens; protocols that wait for one still get
            // their success reply.
            stream.post_dial(Ok(())).await?;
            self.stats.handled.fetch_add(1, Ordering::Relaxed);
            handler.handle(stream).await?;
            return Ok(());
        }

        let Some(dest) = stream.meta.dest.clone() else {
            return Err(GatewayError::NoRoute(format!(
                "stream {} has no destination",
                stream.id()
            )));
        };
        let dialer = config
            .and_then(|c| c.dialer.clone())
            .unwrap_or_else(|| Arc::clone(&self.dialer));

        let dialed = match dialer.dial(&dest).await {
            Ok(dialed) => dialed,
            Err(err) => {
                if let Err(reply_err) = stream.post_dial(Err(&err)).await {
                    debug!(error = %reply_err, "failure reply not delivered");
                }
                return Err(GatewayError::Dial { dest, source: err });
            }
        };
        stream.post_dial(Ok(())).await?;
        self.stats.proxied.fetch_add(1, Ordering::Relaxed);

        stream.proxy_to(dialed, &self.copy_pool).await;
        Ok(())
    }

    fn track(&self, stats: &Arc<StreamStats>) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stats.id(), Arc::clone(stats));
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        self.stats.total.fetch_add(1, Ordering::Relaxed);
    }

    fn untrack(&self, id: StreamId) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }

    fn finish(&self, stats: &StreamStats, outcome: std::thread::Result<Result<()>>) {
        self.untrack(stats.id());
        stats.claim_closed();

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let counter = match &err {
                    e if e.is_classification() => Some(&self.stats.sniff_failed),
                    GatewayError::NoRoute(_) | GatewayError::Misconfigured(_) => {
                        Some(&self.stats.route_failed)
                    }
                    GatewayError::Tls(_) | GatewayError::Cancelled => Some(&self.stats.tls_failed),
                    GatewayError::Dial { .. } => Some(&self.stats.dial_failed),
                    _ => None,
                };
                if let Some(counter) = counter {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                debug!(reason = err.reason(), error = %err, "stream aborted");
            }
            Err(panic) => {
                self.stats.panics.fetch_add(1, Ordering::Relaxed);
                error!(panic = %panic_message(&*panic), "panic while handling stream");
            }
        }

        for (axis, counter) in [
            (ErrorAxis::Read, &self.stats.read_errors),
            (ErrorAxis::Write, &self.stats.write_errors),
            (ErrorAxis::ProxyRead, &self.stats.proxy_read_errors),
            (ErrorAxis::ProxyWrite, &self.stats.proxy_write_errors),
        ] {
            if stats.error(axis).is_some() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }

        let snap = stats.snapshot();
        info!(
            stream_id = snap.id,
            kind = snap.kind.map_or("-", |k| k.as_str()),
            peer = ?snap.peer,
            dest = snap.dest.as_deref().unwrap_or("-"),
            egress = snap.egress,
            rcvd_bytes = snap.rcvd_bytes,
            rcvd_packets = snap.rcvd_packets,
            sent_bytes = snap.sent_bytes,
            sent_packets = snap.sent_packets,
            since_last_read_ms = ?snap.since_last_read_ms,
            since_last_write_ms = ?snap.since_last_write_ms,
            open_ms = snap.open_ms,
            read_err = ?snap.read_err.as_ref().map(|e| &e.message),
            write_err = ?snap.write_err.as_ref().map(|e| &e.message),
            proxy_read_err = ?snap.proxy_read_err.as_ref().map(|e| &e.message),
            proxy_write_err = ?snap.proxy_write_err.as_ref().map(|e| &e.message),
            "stream closed"
        );
    }

    /// Snapshots of every stream currently in flight, ordered by id.
    pub fn active_streams(&self) -> Vec<StreamSnapshot> {
        let mut streams: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.snapshot())
            .collect();
        streams.sort_by_key(|s| s.id);
        streams
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> GatewayStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let s = &self.stats;
        GatewayStatsSnapshot {
            active: load(&s.active),
            total: load(&s.total),
            sniff_failed: load(&s.sniff_failed),
            route_failed: load(&s.route_failed),
            tls_failed: load(&s.tls_failed),
            dial_failed: load(&s.dial_failed),
            handled: load(&s.handled),
            proxied: load(&s.proxied),
            panics: load(&s.panics),
            read_errors: load(&s.read_errors),
            write_errors: load(&s.write_errors),
            proxy_read_errors: load(&s.proxy_read_errors),
            proxy_write_errors: load(&s.proxy_write_errors),
            sniff_pool: self.sniff_pool.stats(),
            copy_pool: self.copy_pool.stats(),
        }
    }

    /// Stop listeners and cancel in-flight TLS handshakes.
    pub fn shutdown(&self) {
        info!("gateway shutting down");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
