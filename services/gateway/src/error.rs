//! Gateway error taxonomy.
//!
//! Classification errors (malformed or oversized preambles, unsupported
//! SOCKS5 requests, sniff timeouts) are fatal to a single connection and are
//! never retried. Transport errors are wrapped as [`GatewayError::Io`] and
//! recorded on the stream's error axes by the proxy loop.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the gateway.
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Errors produced while accepting, classifying and dispatching a connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Sniffed preamble does not fit in one sniff buffer.
    #[error("short buffer: preamble exceeds {capacity} bytes")]
    ShortBuffer { capacity: usize },

    /// The preamble does not match the protocol the listener expects.
    #[error("malformed {protocol} preamble: {detail}")]
    Malformed {
        protocol: &'static str,
        detail: String,
    },

    #[error("unsupported socks5 command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported socks5 address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("socks5 client offered no acceptable auth method")]
    NoAcceptableAuth,

    /// Peer closed the connection before classification finished.
    #[error("connection closed during sniff")]
    ClosedDuringSniff,

    #[error("sniff timed out after {0:?}")]
    SniffTimeout(Duration),

    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("no route for {0}")]
    NoRoute(String),

    #[error("listener misconfigured: {0}")]
    Misconfigured(String),

    #[error("dial {dest} failed: {source}")]
    Dial {
        dest: String,
        #[source]
        source: io::Error,
    },

    #[error("tls handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("tls handshake cancelled")]
    Cancelled,

    #[error("original destination unavailable: {0}")]
    OriginalDst(#[source] io::Error),

    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl GatewayError {
    pub(crate) fn malformed(protocol: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            detail: detail.into(),
        }
    }

    /// Stable short label used in logs and error counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ShortBuffer { .. } => "short_buffer",
            Self::Malformed { .. } => "malformed",
            Self::UnsupportedCommand(_) => "unsupported_command",
            Self::UnsupportedAddressType(_) => "unsupported_address_type",
            Self::NoAcceptableAuth => "no_acceptable_auth",
            Self::ClosedDuringSniff => "closed_during_sniff",
            Self::SniffTimeout(_) => "sniff_timeout",
            Self::PoolExhausted => "pool_exhausted",
            Self::NoRoute(_) => "no_route",
            Self::Misconfigured(_) => "misconfigured",
            Self::Dial { .. } => "dial",
            Self::Tls(_) => "tls",
            Self::Cancelled => "cancelled",
            Self::OriginalDst(_) => "original_dst",
            Self::Io(_) => "io",
        }
    }

    /// True for errors raised while deciding what the connection carries.
    pub fn is_classification(&self) -> bool {
        matches!(
            self,
            Self::ShortBuffer { .. }
                | Self::Malformed { .. }
                | Self::UnsupportedCommand(_)
                | Self::UnsupportedAddressType(_)
                | Self::NoAcceptableAuth
                | Self::ClosedDuringSniff
                | Self::SniffTimeout(_)
        )
    }
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        // AsyncRead can only report io::Error, so gateway errors raised inside
        // a poll_read travel boxed and are unwrapped here.
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<GatewayError>())
        {
            let kind = err.kind();
            return match err.into_inner().map(|inner| inner.downcast::<GatewayError>()) {
                Some(Ok(gateway)) => *gateway,
                Some(Err(other)) => Self::Io(io::Error::new(kind, other)),
                None => Self::Io(io::Error::from(kind)),
            };
        }
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Self::ClosedDuringSniff;
        }
        Self::Io(err)
    }
}

impl From<GatewayError> for io::Error {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Io(inner) => inner,
            GatewayError::ClosedDuringSniff => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            GatewayError::SniffTimeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
            other => io::Error::other(other),
        }
    }
}
