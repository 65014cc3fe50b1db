//! Generic preface detection for ports that accept several protocols.
//!
//! Rules are tested in order after every fill and the first match at the
//! smallest sufficient prefix wins:
//!
//! 1. `05`: SOCKS5
//! 2. `16 03`: TLS
//! 3. `CONNECT`: HTTP CONNECT
//! 4. the 24-byte HTTP/2 client preface
//! 5. a newline or `HTTP/1.1`: plain HTTP/1
//!
//! All sniffed bytes are replayed. SOCKS5, TLS and CONNECT are then handed
//! to their dedicated sniffers so destinations are filled in.

use async_trait::async_trait;

use super::{ConnectSniffer, Sniffer, SniSniffer, Socks5Sniffer};
use crate::error::Result;
use crate::proxy::sniffable::SniffableConn;
use crate::proxy::stream::{Protocol, StreamMeta};

/// HTTP/2 client connection preface (RFC 7540 section 3.5).
pub const H2_CLIENT_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const CONNECT_METHOD: &[u8] = b"CONNECT";

/// Outcome of testing a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// More bytes are needed.
    Incomplete,
    Matched(Protocol),
}

/// Classify the bytes sniffed so far.
pub fn classify(prefix: &[u8]) -> Classification {
    use Classification::*;

    match prefix {
        [] => return Incomplete,
        [0x05, ..] => return Matched(Protocol::Socks5),
        [0x16] => return Incomplete,
        [0x16, 0x03, ..] => return Matched(Protocol::Tls),
        _ => {}
    }

    if prefix.starts_with(CONNECT_METHOD) {
        return Matched(Protocol::Connect);
    }
    if CONNECT_METHOD.starts_with(prefix) {
        return Incomplete;
    }

    if prefix.starts_with(H2_CLIENT_PREFACE) {
        return Matched(Protocol::H2);
    }
    if H2_CLIENT_PREFACE.starts_with(prefix) {
        return Incomplete;
    }

    if prefix.contains(&b'\n') || prefix.windows(8).any(|w| w == b"HTTP/1.1") {
        return Matched(Protocol::Http);
    }
    Incomplete
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrefaceSniffer;

#[async_trait]
impl Sniffer for PrefaceSniffer {
    fn name(&self) -> &'static str {
        "preface"
    }

    async fn sniff(&self, conn: &mut SniffableConn, meta: &mut StreamMeta) -> Result<Protocol> {
        conn.rewind()?;

        let protocol = loop {
            if let Classification::Matched(p) = classify(conn.sniffed()) {
                break p;
            }
            conn.fill().await?;
        };
        conn.reset(0);

        match protocol {
            Protocol::Socks5 => Socks5Sniffer.sniff(conn, meta).await,
            Protocol::Tls => SniSniffer.sniff(conn, meta).await,
            Protocol::Connect => ConnectSniffer.sniff(conn, meta).await,
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::proxy::sniff::testutil::{client_hello, pipe};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use Classification::*;

    #[test]
    fn test_classify_ordered_rules() {
        let check = |prefix: &[u8], expected: Classification| {
            assert_eq!(classify(prefix), expected, "prefix {prefix:?}");
        };
        check(b"", Incomplete);
        check(b"\x05", Matched(Protocol::Socks5));
        check(b"\x16", Incomplete);
        check(b"\x16\x03\x01", Matched(Protocol::Tls));
        check(b"CON", Incomplete);
        check(b"CONNECT x:1 HTTP/1.1", Matched(Protocol::Connect));
        check(b"PRI * HTTP/2.0\r\n", Incomplete);
        check(H2_CLIENT_PREFACE, Matched(Protocol::H2));
        check(b"G", Incomplete);
        check(b"GET / HTTP/1.1\r\n", Matched(Protocol::Http));
        check(b"GET / HTTP/1.1", Matched(Protocol::Http));
        check(b"\x16\x01\n", Matched(Protocol::Http));
    }

    #[tokio::test]
    async fn test_h2_preface_replayed() {
        let (mut conn, mut meta, mut peer) = pipe();
        // Preface arrives in two segments.
        peer.write_all(&H2_CLIENT_PREFACE[..10]).await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            peer.write_all(&H2_CLIENT_PREFACE[10..]).await.unwrap();
            peer.write_all(b"\x00\x00\x00\x04").await.unwrap();
            peer
        });

        let proto = PrefaceSniffer.sniff(&mut conn, &mut meta).await.unwrap();
        assert_eq!(proto, Protocol::H2);
        let _peer = writer.await.unwrap();

        let mut replay = [0u8; 24];
        conn.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay, H2_CLIENT_PREFACE);
    }

    #[tokio::test]
    async fn test_tls_routes_to_sni() {
        let (mut conn, mut meta, mut peer) = pipe();
        let record = client_hello(Some("api.example.com"));
        peer.write_all(&record).await.unwrap();

        let proto = PrefaceSniffer.sniff(&mut conn, &mut meta).await.unwrap();
        assert_eq!(proto, Protocol::Tls);
        assert_eq!(meta.dest.as_deref(), Some("api.example.com:443"));

        let mut replay = vec![0u8; record.len()];
        conn.read_exact(&mut replay).await.unwrap();
        assert_eq!(replay, record);
    }

    #[tokio::test]
    async fn test_socks5_handled_after_preface() {
        let (mut conn, mut meta, mut peer) = pipe();
        peer.write_all(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3, 0x1f, 0x90])
            .await
            .unwrap();

        let proto = PrefaceSniffer.sniff(&mut conn, &mut meta).await.unwrap();
        assert_eq!(proto, Protocol::Socks5);
        assert_eq!(meta.dest.as_deref(), Some("10.1.2.3:8080"));
    }

    #[tokio::test]
    async fn test_binary_garbage_hits_buffer_limit() {
        let (mut conn, mut meta, mut peer) = pipe();
        let writer = tokio::spawn(async move {
            let junk = vec![b'x'; 64 * 1024];
            let _ = peer.write_all(&junk).await;
            peer
        });

        let err = PrefaceSniffer.sniff(&mut conn, &mut meta).await.unwrap_err();
        assert!(matches!(err, GatewayError::ShortBuffer { .. }));
        drop(conn);
        let _ = writer.await;
    }
}
