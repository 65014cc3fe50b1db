//! SNI extraction from a TLS ClientHello.
//!
//! The whole first handshake record is buffered, parsed by hand, and then
//! replayed from offset 0 so the relay target or the local TLS stack sees
//! the original bytes unchanged.
//!
//! TLS record / ClientHello layout:
//! - record: type (22), version (2), length (2), fragment
//! - handshake: type (1 = ClientHello), length (3)
//! - client version (2), random (32)
//! - session id: u8 length + bytes
//! - cipher suites: u16 length + bytes
//! - compression methods: u8 length + bytes
//! - extensions: u16 length, then (type u16, length u16, data)*

use async_trait::async_trait;
use tracing::debug;

use super::Sniffer;
use crate::error::{GatewayError, Result};
use crate::proxy::sniffable::SniffableConn;
use crate::proxy::stream::{Protocol, StreamMeta};

pub const RECORD_HEADER_LEN: usize = 5;
pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;

/// Largest ClientHello record accepted.
pub const MAX_CLIENT_HELLO_RECORD: usize = 4096;

/// Port assumed for SNI destinations unless the listener remaps it.
pub const SNI_DEFAULT_PORT: u16 = 443;

/// Classifies TLS and extracts the SNI host name.
#[derive(Debug, Clone, Copy, Default)]
pub struct SniSniffer;

impl SniSniffer {
    /// Buffer the first TLS record and return the SNI, leaving the
    /// connection in sniffing mode.
    pub(crate) async fn read_sni(conn: &mut SniffableConn) -> Result<Option<String>> {
        conn.rewind()?;
        conn.fill_to(RECORD_HEADER_LEN).await?;

        let header = &conn.sniffed()[..RECORD_HEADER_LEN];
        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(GatewayError::malformed(
                "tls",
                format!("record type {} is not handshake", header[0]),
            ));
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len > MAX_CLIENT_HELLO_RECORD {
            return Err(GatewayError::malformed(
                "tls",
                format!("record length {record_len} exceeds {MAX_CLIENT_HELLO_RECORD}"),
            ));
        }

        conn.fill_to(RECORD_HEADER_LEN + record_len).await?;
        parse_client_hello(&conn.sniffed()[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len])
    }
}

#[async_trait]
impl Sniffer for SniSniffer {
    fn name(&self) -> &'static str {
        "sni"
    }

    async fn sniff(&self, conn: &mut SniffableConn, meta: &mut StreamMeta) -> Result<Protocol> {
        let sni = Self::read_sni(conn).await?;
        conn.reset(0);
        apply_sni(meta, sni);
        Ok(Protocol::Tls)
    }
}

/// Record the SNI destination on the stream.
pub(crate) fn apply_sni(meta: &mut StreamMeta, sni: Option<String>) {
    let Some(host) = sni else {
        debug!(stream_id = meta.id, "ClientHello without SNI");
        return;
    };
    let port = meta
        .listener
        .as_ref()
        .and_then(|l| l.sni_port)
        .unwrap_or(SNI_DEFAULT_PORT);
    debug!(stream_id = meta.id, sni = %host, port, "SNI extracted");
    meta.set_dest(format!("{host}:{port}"));
}

/// Bounds-checked cursor over a ClientHello.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let out = &self.data[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(GatewayError::malformed(
                "tls",
                format!("{what} overruns ClientHello at offset {}", self.pos),
            )),
        }
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    fn vec16(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Parse a handshake fragment and return the SNI host name, if present.
///
/// Every length that points past the data is an error. Unknown extensions
/// are skipped by their declared length.
pub fn parse_client_hello(fragment: &[u8]) -> Result<Option<String>> {
    let mut r = Reader::new(fragment);

    let msg_type = r.u8("handshake type")?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Err(GatewayError::malformed(
            "tls",
            format!("handshake type {msg_type} is not ClientHello"),
        ));
    }
    let len = r.take(3, "handshake length")?;
    let hello_len = u32::from_be_bytes([0, len[0], len[1], len[2]]) as usize;
    let mut r = Reader::new(r.take(hello_len, "ClientHello body")?);

    r.take(34, "version and random")?;
    let session_id = r.vec8("session id")?;
    if session_id.len() > 32 {
        return Err(GatewayError::malformed("tls", "session id longer than 32"));
    }
    r.vec16("cipher suites")?;
    r.vec8("compression methods")?;

    if r.is_empty() {
        return Ok(None);
    }
    let mut exts = Reader::new(r.vec16("extensions")?);

    while !exts.is_empty() {
        let ext_type = exts.u16("extension type")?;
        let data = exts.vec16("extension data")?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(data);
        }
    }
    Ok(None)
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>> {
    let mut outer = Reader::new(data);
    let mut list = Reader::new(outer.vec16("server name list")?);

    while !list.is_empty() {
        let name_type = list.u8("server name type")?;
        let name = list.vec16("server name")?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }
        let host = std::str::from_utf8(name)
            .map_err(|_| GatewayError::malformed("tls", "server name is not utf-8"))?;
        if host.is_empty() {
            return Err(GatewayError::malformed("tls", "empty server name"));
        }
        if host.ends_with('.') {
            return Err(GatewayError::malformed("tls", "server name has trailing dot"));
        }
        return Ok(Some(host.to_string()));
    }
    Ok(None)
}
