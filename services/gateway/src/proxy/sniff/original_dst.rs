//! iptables REDIRECT destination recovery.
//!
//! Connections captured by `-j REDIRECT` arrive on the gateway's port with
//! the pre-NAT destination stored in conntrack. `SO_ORIGINAL_DST` (IPv4) and
//! `IP6T_SO_ORIGINAL_DST` (IPv6) read it back. No payload is inspected.
//!
//! tokio sockets stay non-blocking throughout, so the returned connection is
//! the accepted one, used as is.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::Sniffer;
use crate::error::{GatewayError, Result};
use crate::proxy::sniffable::SniffableConn;
use crate::proxy::stream::{Protocol, StreamMeta};

/// `SO_ORIGINAL_DST` at `SOL_IP`.
pub const SO_ORIGINAL_DST: i32 = 80;

/// `IP6T_SO_ORIGINAL_DST` at `SOL_IPV6`.
pub const IP6T_SO_ORIGINAL_DST: i32 = 80;

/// Source of pre-NAT destinations. Swappable so tests can run without
/// iptables rules.
pub trait OriginalDstLookup: Send + Sync {
    fn original_dst(&self, socket: &TcpStream) -> io::Result<SocketAddr>;
}

/// Reads the original destination with `getsockopt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SockoptLookup;

impl OriginalDstLookup for SockoptLookup {
    #[cfg(target_os = "linux")]
    fn original_dst(&self, socket: &TcpStream) -> io::Result<SocketAddr> {
        use std::os::fd::AsRawFd;

        let fd = socket.as_raw_fd();
        match socket.local_addr()? {
            SocketAddr::V6(local) if local.ip().to_ipv4_mapped().is_none() => sys::original_dst_v6(fd),
            _ => sys::original_dst_v4(fd),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn original_dst(&self, _socket: &TcpStream) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SO_ORIGINAL_DST is only available on Linux",
        ))
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
    use std::os::fd::RawFd;

    use super::{IP6T_SO_ORIGINAL_DST, SO_ORIGINAL_DST};

    pub(super) fn original_dst_v4(fd: RawFd) -> io::Result<SocketAddr> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
    }

    pub(super) fn original_dst_v6(fd: RawFd) -> io::Result<SocketAddr> {
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IPV6,
                IP6T_SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::from(addr.sin6_addr.s6_addr),
            u16::from_be(addr.sin6_port),
            addr.sin6_flowinfo,
            addr.sin6_scope_id,
        )))
    }
}

/// Recovers the destination of REDIRECT-captured connections.
pub struct OriginalDstSniffer {
    lookup: Arc<dyn OriginalDstLookup>,
    egress: bool,
}

impl OriginalDstSniffer {
    /// Locally originated traffic (`iptables`).
    pub fn egress(lookup: Arc<dyn OriginalDstLookup>) -> Self {
        Self {
            lookup,
            egress: true,
        }
    }

    /// Inbound traffic routed by destination (`iptables-in`).
    pub fn ingress(lookup: Arc<dyn OriginalDstLookup>) -> Self {
        Self {
            lookup,
            egress: false,
        }
    }
}

#[async_trait]
impl Sniffer for OriginalDstSniffer {
    fn name(&self) -> &'static str {
        if self.egress {
            "iptables"
        } else {
            "iptables-in"
        }
    }

    async fn sniff(&self, conn: &mut SniffableConn, meta: &mut StreamMeta) -> Result<Protocol> {
        let socket = conn.get_ref().tcp().ok_or_else(|| {
            GatewayError::OriginalDst(io::Error::new(
                io::ErrorKind::Unsupported,
                "not a tcp socket",
            ))
        })?;
        let dest = self
            .lookup
            .original_dst(socket)
            .map_err(GatewayError::OriginalDst)?;
        debug!(stream_id = meta.id, dest = %dest, "original destination recovered");

        meta.set_dest(dest.to_string());
        meta.egress = self.egress;
        Ok(if self.egress {
            Protocol::Iptables
        } else {
            Protocol::IptablesIn
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::buffer::BufferPool;
    use crate::proxy::stream::{next_stream_id, StreamStats};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FixedLookup(SocketAddr);

    impl OriginalDstLookup for FixedLookup {
        fn original_dst(&self, _socket: &TcpStream) -> io::Result<SocketAddr> {
            Ok(self.0)
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_recovered_destination_and_usable_socket() {
        let (server, mut client) = tcp_pair().await;
        let stats = StreamStats::new(next_stream_id());
        let mut conn = SniffableConn::new(Box::new(server), BufferPool::sniff(), stats.clone());
        let mut meta = StreamMeta::new(stats);

        let original: SocketAddr = "10.20.30.40:8443".parse().unwrap();
        let sniffer = OriginalDstSniffer::egress(Arc::new(FixedLookup(original)));
        let proto = sniffer.sniff(&mut conn, &mut meta).await.unwrap();

        assert_eq!(proto, Protocol::Iptables);
        assert_eq!(meta.dest.as_deref(), Some("10.20.30.40:8443"));
        assert_eq!(meta.dest_addr, Some(original));
        assert!(meta.egress);

        client.write_all(b"still").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still");
        conn.write_all(b"open").await.unwrap();
        let mut back = [0u8; 4];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"open");
    }

    #[tokio::test]
    async fn test_ingress_variant_not_egress() {
        let (server, _client) = tcp_pair().await;
        let stats = StreamStats::new(next_stream_id());
        let mut conn = SniffableConn::new(Box::new(server), BufferPool::sniff(), stats.clone());
        let mut meta = StreamMeta::new(stats);

        let sniffer =
            OriginalDstSniffer::ingress(Arc::new(FixedLookup("[fd00::7]:80".parse().unwrap())));
        assert_eq!(
            sniffer.sniff(&mut conn, &mut meta).await.unwrap(),
            Protocol::IptablesIn
        );
        assert!(!meta.egress);
        assert_eq!(meta.dest.as_deref(), Some("[fd00::7]:80"));
    }

    #[tokio::test]
    async fn test_non_tcp_transport_rejected() {
        let (a, _b) = tokio::io::duplex(16);
        let stats = StreamStats::new(next_stream_id());
        let mut conn = SniffableConn::new(Box::new(a), BufferPool::sniff(), stats.clone());
        let mut meta = StreamMeta::new(stats);

        let sniffer = OriginalDstSniffer::egress(Arc::new(SockoptLookup));
        assert!(matches!(
            sniffer.sniff(&mut conn, &mut meta).await,
            Err(GatewayError::OriginalDst(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sockopt_without_redirect_fails() {
        let (server, _client) = tcp_pair().await;
        assert!(SockoptLookup.original_dst(&server).is_err());
    }
}
