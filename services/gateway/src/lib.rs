//! meshgate: a transparent multi-protocol gateway core.

pub mod config;
pub mod debug;
pub mod error;
pub mod proxy;

pub use error::{GatewayError, Result};
pub use proxy::{
    AcceptPolicy, BufferPool, Dialer, EchoHandler, Gateway, ListenerConfig, PortListener, Protocol,
    RouteResolver, RouteTable, SharedRouteTable, Stream, StreamHandler, StreamMeta, TcpDialer,
};
