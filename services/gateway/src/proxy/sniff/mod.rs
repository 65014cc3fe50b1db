//! Protocol sniffers.
//!
//! Every sniffer follows the same convention: read until the preamble is
//! classified, then leave the connection positioned so the next layer sees
//! either the full original bytes (relay, TLS termination) or only the bytes
//! after a fully consumed header (SOCKS5, CONNECT).
//!
//! The dispatcher picks the sniffer from a [`SnifferRegistry`] keyed by the
//! listener's configured protocol.

pub mod connect;
pub mod original_dst;
pub mod preface;
pub mod socks5;
pub mod tls;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::sniffable::SniffableConn;
use super::stream::{Protocol, StreamMeta};
use crate::error::Result;

pub use connect::ConnectSniffer;
pub use original_dst::{OriginalDstLookup, OriginalDstSniffer, SockoptLookup};
pub use preface::{classify, Classification, PrefaceSniffer, H2_CLIENT_PREFACE};
pub use socks5::Socks5Sniffer;
pub use tls::{parse_client_hello, SniSniffer};

/// Classifies the leading bytes of a connection.
#[async_trait]
pub trait Sniffer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Classify `conn`, filling in destination and flags on `meta`.
    async fn sniff(&self, conn: &mut SniffableConn, meta: &mut StreamMeta) -> Result<Protocol>;
}

/// Maps a listener protocol to the sniffer that serves it.
#[derive(Clone, Default)]
pub struct SnifferRegistry {
    by_protocol: HashMap<Protocol, Arc<dyn Sniffer>>,
}

impl SnifferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in sniffer.
    pub fn with_defaults(lookup: Arc<dyn OriginalDstLookup>) -> Self {
        let mut registry = Self::new();
        let preface: Arc<dyn Sniffer> = Arc::new(PrefaceSniffer);
        registry.register(Protocol::Tls, Arc::new(SniSniffer));
        registry.register(Protocol::Https, Arc::clone(&preface));
        registry.register(Protocol::Http, Arc::clone(&preface));
        registry.register(Protocol::H2, preface);
        registry.register(Protocol::Socks5, Arc::new(Socks5Sniffer));
        registry.register(Protocol::Connect, Arc::new(ConnectSniffer));
        registry.register(
            Protocol::Iptables,
            Arc::new(OriginalDstSniffer::egress(Arc::clone(&lookup))),
        );
        registry.register(
            Protocol::IptablesIn,
            Arc::new(OriginalDstSniffer::ingress(lookup)),
        );
        registry
    }

    pub fn register(&mut self, protocol: Protocol, sniffer: Arc<dyn Sniffer>) {
        self.by_protocol.insert(protocol, sniffer);
    }

    /// `None` means the listener has a static destination and is not sniffed.
    pub fn get(&self, protocol: Protocol) -> Option<&Arc<dyn Sniffer>> {
        self.by_protocol.get(&protocol)
    }
}

impl std::fmt::Debug for SnifferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.by_protocol.iter().map(|(p, s)| (p, s.name())))
            .finish()
    }
}
