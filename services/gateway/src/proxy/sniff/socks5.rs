//! SOCKS5 CONNECT handshake (RFC 1928, no-auth only).
//!
//! The sniffer acts as a minimal server. It answers method negotiation
//! mid-sniff, parses the CONNECT request and defers the final reply to the
//! post-dial hook, since the reply carries the outcome of the dial.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::Sniffer;
use crate::error::{GatewayError, Result};
use crate::proxy::sniffable::SniffableConn;
use crate::proxy::stream::{PostDial, Protocol, StreamMeta};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Length of `VER CMD RSV ATYP` plus the first address byte.
const REQUEST_PREFIX_LEN: usize = 5;

/// SOCKS5 sniffer for egress capture.
#[derive(Debug, Clone, Copy, Default)]
pub struct Socks5Sniffer;

#[async_trait]
impl Sniffer for Socks5Sniffer {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn sniff(&self, conn: &mut SniffableConn, meta: &mut StreamMeta) -> Result<Protocol> {
        conn.rewind()?;

        conn.fill_to(2).await?;
        let head = conn.sniffed();
        if head[0] != VERSION {
            return Err(GatewayError::malformed(
                "socks5",
                format!("version byte {:#04x}", head[0]),
            ));
        }
        let greeting_len = 2 + head[1] as usize;
        conn.fill_to(greeting_len).await?;

        if !conn.sniffed()[2..greeting_len].contains(&METHOD_NO_AUTH) {
            conn.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
            return Err(GatewayError::NoAcceptableAuth);
        }
        conn.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
        conn.flush().await?;

        conn.fill_to(greeting_len + REQUEST_PREFIX_LEN).await?;
        let req = &conn.sniffed()[greeting_len..];
        if req[0] != VERSION {
            return Err(GatewayError::malformed(
                "socks5",
                format!("request version byte {:#04x}", req[0]),
            ));
        }
        let (cmd, atyp, domain_len) = (req[1], req[3], req[4] as usize);
        let request_len = match atyp {
            ATYP_IPV4 => 10,
            ATYP_IPV6 => 22,
            ATYP_DOMAIN if domain_len == 0 => {
                return Err(GatewayError::malformed("socks5", "empty domain name"));
            }
            ATYP_DOMAIN => 7 + domain_len,
            other => {
                conn.write_all(&reply(REPLY_ADDRESS_NOT_SUPPORTED, None))
                    .await?;
                return Err(GatewayError::UnsupportedAddressType(other));
            }
        };
        if cmd != CMD_CONNECT {
            conn.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED, None))
                .await?;
            return Err(GatewayError::UnsupportedCommand(cmd));
        }

        let header_len = greeting_len + request_len;
        conn.fill_to(header_len).await?;
        let dest = parse_address(&conn.sniffed()[greeting_len..header_len])?;
        debug!(stream_id = meta.id, dest = %dest, "SOCKS5 CONNECT");

        meta.set_dest(dest);
        meta.egress = true;
        meta.post_dial = Some(PostDial::Socks5Reply);

        // Payload the client pipelined behind the request is replayed.
        conn.reset(header_len);
        Ok(Protocol::Socks5)
    }
}

/// Parse `VER CMD RSV ATYP ADDR PORT` into `host:port`.
fn parse_address(req: &[u8]) -> Result<String> {
    let port = u16::from_be_bytes([req[req.len() - 2], req[req.len() - 1]]);
    let addr = &req[4..req.len() - 2];
    let dest = match req[3] {
        ATYP_IPV4 => {
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            SocketAddr::new(ip.into(), port).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            SocketAddr::new(Ipv6Addr::from(octets).into(), port).to_string()
        }
        _ => {
            let host = std::str::from_utf8(&addr[1..])
                .map_err(|_| GatewayError::malformed("socks5", "domain is not utf-8"))?;
            format!("{host}:{port}")
        }
    };
    Ok(dest)
}

/// Encode a reply. The bound address is the gateway's local address; without
/// one the zero IPv4 address is sent.
pub fn reply(code: u8, bound: Option<SocketAddr>) -> Vec<u8> {
    let mut out = vec![VERSION, code, 0x00];
    match bound {
        Some(SocketAddr::V4(addr)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => out.extend_from_slice(&[ATYP_IPV4, 0, 0, 0, 0, 0, 0]),
    }
    out
}

/// Map a dial error to a SOCKS5 reply code.
pub fn reply_code(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::HostUnreachable | io::ErrorKind::TimedOut => REPLY_HOST_UNREACHABLE,
        io::ErrorKind::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
        _ => REPLY_GENERAL_FAILURE,
    }
}
