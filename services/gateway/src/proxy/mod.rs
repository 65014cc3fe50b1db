//! Transparent multi-protocol proxy core.
//!
//! This module provides:
//! - Port listeners with optional accept backpressure
//! - Replayable sniffing over pooled buffers
//! - Sniffers for TLS SNI, SOCKS5, HTTP CONNECT, HTTP/2 prefaces and
//!   iptables-redirected connections
//! - Host-based routing with wildcard suffixes
//! - Local TLS termination
//! - A bidirectional proxy loop (splice on Linux, pooled buffers elsewhere)
//!
//! ## Architecture
//!
//! ```text
//! Client -> PortListener -> Gateway -> Sniffer -> RouteResolver
//!                                         |
//!                              (TLS termination if configured)
//!                                         |
//!                            StreamHandler  or  Dialer -> proxy loop -> Upstream
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use meshgate::proxy::{Gateway, ListenerConfig, PortListener, Protocol, RouteTable};
//!
//! let routes = Arc::new(RouteTable::new());
//! let gateway = Arc::new(Gateway::new(routes));
//!
//! let config = Arc::new(ListenerConfig::new("[::]:1080", Protocol::Socks5));
//! let listener = PortListener::bind(config, gateway).await?;
//! listener.run().await?;
//! ```

pub mod buffer;
pub mod copy;
pub mod dial;
pub mod dispatch;
pub mod handler;
pub mod listener;
pub mod router;
pub mod sniff;
pub mod sniffable;
#[cfg(target_os = "linux")]
mod splice;
pub mod stream;
pub mod tls;
pub mod transport;

use tokio::sync::watch;

pub use buffer::{BufferPool, PoolStats, PooledBuf};
pub use copy::ProxySummary;
pub use dial::{Dialer, TcpDialer};
pub use dispatch::{Gateway, GatewayStatsSnapshot};
pub use handler::{EchoHandler, StreamHandler};
pub use listener::{AcceptPolicy, ListenerStats, PortListener};
pub use router::{ListenerConfig, RouteResolver, RouteTable, SharedRouteTable};
pub use sniff::{Sniffer, SnifferRegistry};
pub use sniffable::SniffableConn;
pub use stream::{ErrorAxis, Protocol, Stream, StreamMeta, StreamSnapshot, StreamStats};
pub use tls::{RustlsTerminator, TlsTerminator};
pub use transport::{BoxTransport, Transport};

/// Resolves once `rx` reads `true`. A dropped sender never resolves.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
