//! HTTP `CONNECT` proxy requests.
//!
//! The request head is buffered up to the blank line, the authority is taken
//! as the destination and the `200`/`502` status line is written once the
//! dial outcome is known. Bytes after the head are replayed.

use async_trait::async_trait;
use tracing::debug;

use super::Sniffer;
use crate::error::{GatewayError, Result};
use crate::proxy::sniffable::SniffableConn;
use crate::proxy::stream::{PostDial, Protocol, StreamMeta};

pub const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectSniffer;

#[async_trait]
impl Sniffer for ConnectSniffer {
    fn name(&self) -> &'static str {
        "connect"
    }

    async fn sniff(&self, conn: &mut SniffableConn, meta: &mut StreamMeta) -> Result<Protocol> {
        conn.rewind()?;

        let head_len = loop {
            if let Some(pos) = find(conn.sniffed(), HEAD_TERMINATOR) {
                break pos + HEAD_TERMINATOR.len();
            }
            conn.fill().await?;
        };

        let authority = parse_request_line(&conn.sniffed()[..head_len])?;
        debug!(stream_id = meta.id, dest = %authority, "HTTP CONNECT");

        meta.set_dest(authority);
        meta.egress = true;
        meta.post_dial = Some(PostDial::ConnectReply);
        conn.reset(head_len);
        Ok(Protocol::Connect)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract the `host:port` authority from `CONNECT host:port HTTP/1.x`.
fn parse_request_line(head: &[u8]) -> Result<String> {
    let line_end = find(head, b"\r\n").unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| GatewayError::malformed("connect", "request line is not utf-8"))?;

    let mut parts = line.split(' ');
    let (Some("CONNECT"), Some(authority), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(GatewayError::malformed("connect", format!("bad request line '{line}'")));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(GatewayError::malformed("connect", format!("bad version '{version}'")));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(authority.to_string())
        }
        _ => Err(GatewayError::malformed(
            "connect",
            format!("authority '{authority}' has no port"),
        )),
    }
}
