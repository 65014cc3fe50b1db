//! Listener configuration and destination routing.
//!
//! A [`ListenerConfig`] describes what to do with a stream: where to forward
//! it, whether to terminate TLS, or which in-process handler owns it. The
//! same struct serves as a port listener's static config and as a route
//! entry selected by sniffed destination.
//!
//! Route lookup order for a destination `host:port`:
//! - exact `host:port`
//! - normalized host (lowercase, trailing dot trimmed)
//! - longest matching `*.suffix` wildcard
//! - the default route
//!
//! Updates swap an immutable snapshot, so lookups never block and a reload
//! never affects streams that already resolved their config.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use super::dial::Dialer;
use super::handler::StreamHandler;
use super::stream::{Protocol, StreamMeta};

/// Static configuration for a listener or route.
#[derive(Clone)]
pub struct ListenerConfig {
    /// `host:port`, or `unix:/path` for a Unix socket listener.
    pub address: String,
    pub protocol: Protocol,
    /// Static destination that overrides anything sniffed.
    pub forward_to: Option<String>,
    /// Terminate TLS locally with this config.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// In-process handler. Takes precedence over dialing.
    pub handler: Option<Arc<dyn StreamHandler>>,
    /// Dialer for this config. The gateway default is used when unset.
    pub dialer: Option<Arc<dyn Dialer>>,
    /// Port appended to SNI destinations instead of 443.
    pub sni_port: Option<u16>,
    /// Accept backpressure; unbounded when unset.
    pub max_connections: Option<usize>,
    /// Per-listener sniff timeout; the gateway default when unset.
    pub sniff_timeout: Option<Duration>,
}

impl ListenerConfig {
    pub fn new(address: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            address: address.into(),
            protocol,
            forward_to: None,
            tls: None,
            handler: None,
            dialer: None,
            sni_port: None,
            max_connections: None,
            sniff_timeout: None,
        }
    }

    pub fn with_forward_to(mut self, dest: impl Into<String>) -> Self {
        self.forward_to = Some(dest.into());
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_sni_port(mut self, port: u16) -> Self {
        self.sni_port = Some(port);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_sniff_timeout(mut self, timeout: Duration) -> Self {
        self.sniff_timeout = Some(timeout);
        self
    }

    /// Unix socket path if the address carries the `unix:` prefix.
    pub fn unix_path(&self) -> Option<&str> {
        self.address.strip_prefix("unix:")
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("address", &self.address)
            .field("protocol", &self.protocol)
            .field("forward_to", &self.forward_to)
            .field("tls", &self.tls.is_some())
            .field("handler", &self.handler.is_some())
            .field("dialer", &self.dialer.is_some())
            .field("sni_port", &self.sni_port)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Selects the config for a classified stream.
pub trait RouteResolver: Send + Sync {
    /// Config for the stream's destination, if any route matches.
    fn resolve(&self, meta: &StreamMeta) -> Option<Arc<ListenerConfig>>;

    /// Config used when a stream reaches dispatch with none attached.
    fn default_listener(&self) -> Option<Arc<ListenerConfig>>;
}

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

/// Split `host:port` or `[v6]:port` into the bare host and port.
fn split_host_port(dest: &str) -> (&str, Option<&str>) {
    match dest.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            let host = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host);
            if host.contains(':') && !dest.starts_with('[') {
                // Bare IPv6 literal without a port.
                return (dest, None);
            }
            (host, Some(port))
        }
        _ => (dest, None),
    }
}

/// Immutable snapshot of route data for lock-free reads.
#[derive(Debug, Default, Clone)]
struct RouteSnapshot {
    /// Exact keys: `host` or `host:port`, normalized.
    exact: HashMap<String, Arc<ListenerConfig>>,
    /// `*.suffix` entries keyed by `suffix`.
    wildcard: HashMap<String, Arc<ListenerConfig>>,
    default: Option<Arc<ListenerConfig>>,
}

impl RouteSnapshot {
    fn from_routes(routes: Vec<(String, Arc<ListenerConfig>)>, default: Option<Arc<ListenerConfig>>) -> Self {
        let mut snapshot = Self {
            default,
            ..Self::default()
        };
        for (host, config) in routes {
            snapshot.insert(&host, config);
        }
        snapshot
    }

    fn insert(&mut self, host: &str, config: Arc<ListenerConfig>) {
        let key = normalize_hostname(host);
        match key.strip_prefix("*.") {
            Some(suffix) => {
                self.wildcard.insert(suffix.to_string(), config);
            }
            None => {
                self.exact.insert(key, config);
            }
        }
    }

    fn remove(&mut self, host: &str) -> bool {
        let key = normalize_hostname(host);
        match key.strip_prefix("*.") {
            Some(suffix) => self.wildcard.remove(suffix).is_some(),
            None => self.exact.remove(&key).is_some(),
        }
    }

    fn lookup(&self, dest: &str) -> Option<&Arc<ListenerConfig>> {
        let (host, port) = split_host_port(dest);
        let host = normalize_hostname(host);

        if let Some(port) = port {
            let with_port = if host.contains(':') {
                format!("[{host}]:{port}")
            } else {
                format!("{host}:{port}")
            };
            if let Some(config) = self.exact.get(&with_port) {
                return Some(config);
            }
        }
        if let Some(config) = self.exact.get(&host) {
            return Some(config);
        }

        // Longest suffix wins: walk labels from the left.
        let mut rest = host.as_str();
        while let Some((_, suffix)) = rest.split_once('.') {
            if let Some(config) = self.wildcard.get(suffix) {
                return Some(config);
            }
            rest = suffix;
        }
        None
    }

    fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }
}

/// Route table managing all active routes.
///
/// Uses ArcSwap for lock-free atomic config updates.
/// Readers get consistent snapshots without blocking.
/// Writers atomically swap in new snapshots.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Replace every route and the default in a single pointer swap.
    pub fn update(
        &self,
        routes: Vec<(String, Arc<ListenerConfig>)>,
        default: Option<Arc<ListenerConfig>>,
    ) {
        let snapshot = RouteSnapshot::from_routes(routes, default);
        let route_count = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));
        info!(route_count, "Route table updated atomically");
    }

    /// Add or update a single route atomically.
    pub fn upsert(&self, host: &str, config: Arc<ListenerConfig>) {
        self.snapshot.rcu(|current| {
            let mut next = RouteSnapshot::clone(current);
            next.insert(host, Arc::clone(&config));
            next
        });
    }

    /// Remove a route by host key. Returns whether it existed.
    pub fn remove(&self, host: &str) -> bool {
        let mut removed = false;
        self.snapshot.rcu(|current| {
            let mut next = RouteSnapshot::clone(current);
            removed = next.remove(host);
            next
        });
        removed
    }

    pub fn set_default(&self, config: Option<Arc<ListenerConfig>>) {
        self.snapshot.rcu(|current| {
            let mut next = RouteSnapshot::clone(current);
            next.default = config.clone();
            next
        });
    }

    /// Route for `dest`, falling back to the default route.
    pub fn get(&self, dest: &str) -> Option<Arc<ListenerConfig>> {
        let snapshot = self.snapshot.load();
        snapshot
            .lookup(dest)
            .or(snapshot.default.as_ref())
            .cloned()
    }

    /// Get the total number of routes, excluding the default.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteResolver for RouteTable {
    fn resolve(&self, meta: &StreamMeta) -> Option<Arc<ListenerConfig>> {
        let dest = meta.dest.as_deref()?;
        let snapshot = self.snapshot.load();
        let config = snapshot.lookup(dest).cloned();
        debug!(
            stream_id = meta.id,
            dest,
            matched = config.is_some(),
            "Route lookup"
        );
        config
    }

    fn default_listener(&self) -> Option<Arc<ListenerConfig>> {
        self.snapshot.load().default.clone()
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;
