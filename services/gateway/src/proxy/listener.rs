//! Port listener accept loop.
//!
//! Every accepted connection is dispatched on its own task. Accept errors
//! that signal a transient condition (descriptor exhaustion, an aborted
//! handshake) are retried after a fixed 100ms pause; anything else stops the
//! listener.
//!
//! Concurrency is unbounded unless the listener sets `max_connections`, in
//! which case a permit is taken *before* `accept()`, so excess connections
//! wait in the kernel backlog instead of being accepted and dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::cancelled;
use super::dispatch::Gateway;
use super::router::ListenerConfig;
use super::transport::BoxTransport;

/// Pause after a transient accept error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept backpressure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptPolicy {
    /// Accept as fast as the kernel delivers connections.
    #[default]
    Unbounded,
    /// At most this many connections in flight.
    Bounded(usize),
}

impl AcceptPolicy {
    pub fn from_limit(max_connections: Option<usize>) -> Self {
        match max_connections {
            Some(max) => Self::Bounded(max),
            None => Self::Unbounded,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Transient accept errors that were retried.
    pub accept_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ListenerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub accept_errors: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
        }
    }
}

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Acceptor {
    async fn accept(&self) -> io::Result<(BoxTransport, Option<SocketAddr>)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(error = %err, "set_nodelay failed");
                }
                Ok((Box::new(stream), Some(peer)))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), None))
            }
        }
    }
}

/// True for accept errors worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        if matches!(
            code,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EINTR | libc::EAGAIN
        ) {
            return true;
        }
    }
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}

/// An accept loop bound to one listener config.
pub struct PortListener {
    config: Arc<ListenerConfig>,
    acceptor: Acceptor,
    gateway: Arc<Gateway>,
    permits: Option<Arc<Semaphore>>,
    stats: Arc<ListenerStats>,
}

impl PortListener {
    /// Bind the listener's address. `unix:` addresses bind a Unix socket,
    /// replacing a stale socket file.
    pub async fn bind(config: Arc<ListenerConfig>, gateway: Arc<Gateway>) -> io::Result<Self> {
        let acceptor = match config.unix_path() {
            #[cfg(unix)]
            Some(path) => {
                if std::fs::symlink_metadata(path).is_ok() {
                    std::fs::remove_file(path)?;
                }
                Acceptor::Unix(tokio::net::UnixListener::bind(path)?)
            }
            #[cfg(not(unix))]
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix listeners need a unix platform",
                ))
            }
            None => Acceptor::Tcp(TcpListener::bind(config.address.as_str()).await?),
        };

        let policy = AcceptPolicy::from_limit(config.max_connections);
        let permits = match policy {
            AcceptPolicy::Bounded(max) => Some(Arc::new(Semaphore::new(max))),
            AcceptPolicy::Unbounded => None,
        };

        let listener = Self {
            config,
            acceptor,
            gateway,
            permits,
            stats: Arc::new(ListenerStats::default()),
        };
        info!(
            address = %listener.config.address,
            bound = ?listener.local_addr(),
            protocol = %listener.config.protocol,
            policy = ?policy,
            "Listener bound"
        );
        Ok(listener)
    }

    /// Bound TCP address; `None` for Unix listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.acceptor {
            Acceptor::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Acceptor::Unix(_) => None,
        }
    }

    pub fn config(&self) -> &Arc<ListenerConfig> {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Accept until gateway shutdown or a fatal accept error.
    pub async fn run(self) -> io::Result<()> {
        let mut shutdown = self.gateway.shutdown_signal();
        info!(address = %self.config.address, "Listener started");

        loop {
            let permit = match self.acquire(&mut shutdown).await? {
                Some(permit) => permit,
                None => break,
            };

            let accepted = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                accepted = self.acceptor.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer)) => {
                    debug!(peer = ?peer, "Accepted connection");
                    self.dispatch(conn, permit);
                }
                Err(err) if is_transient(&err) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "Transient accept error, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(err) => {
                    error!(address = %self.config.address, error = %err, "Accept failed, listener stopping");
                    return Err(err);
                }
            }
        }

        info!(address = %self.config.address, "Listener stopped");
        Ok(())
    }

    /// Wait for a permit under a bounded policy. `Ok(None)` means shutdown.
    async fn acquire(
        &self,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> io::Result<Option<Option<OwnedSemaphorePermit>>> {
        let Some(permits) = &self.permits else {
            return Ok(Some(None));
        };
        tokio::select! {
            biased;
            _ = cancelled(shutdown) => Ok(None),
            permit = Arc::clone(permits).acquire_owned() => permit
                .map(|p| Some(Some(p)))
                .map_err(io::Error::other),
        }
    }

    fn dispatch(&self, conn: BoxTransport, permit: Option<OwnedSemaphorePermit>) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let gateway = Arc::clone(&self.gateway);
        let config = Arc::clone(&self.config);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            gateway.handle_accepted_conn(config, conn).await;

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            drop(permit);
        });
    }
}
