//! Outbound connection establishment.
//!
//! - Connect timeout: 5s default
//! - `unix:/path` destinations dial a Unix socket
//! - Custom dialers (tunnels, test doubles) plug in through [`Dialer`]

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::transport::BoxTransport;

/// Default connect timeout for dialed destinations.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the upstream side of a proxied stream.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dest: &str) -> io::Result<BoxTransport>;
}

/// Dials TCP (or Unix) destinations with a connect timeout.
#[derive(Debug)]
pub struct TcpDialer {
    connect_timeout: Duration,
    attempted: AtomicU64,
    succeeded: AtomicU64,
}

/// Dial counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DialStats {
    pub attempted: u64,
    pub succeeded: u64,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DialStats {
        DialStats {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
        }
    }

    async fn connect(&self, dest: &str) -> io::Result<BoxTransport> {
        #[cfg(unix)]
        if let Some(path) = dest.strip_prefix("unix:") {
            let stream = tokio::net::UnixStream::connect(path).await?;
            return Ok(Box::new(stream));
        }

        let stream = TcpStream::connect(dest).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, dest: &str) -> io::Result<BoxTransport> {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        debug!(dest, "Dialing destination");

        let conn = match timeout(self.connect_timeout, self.connect(dest)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {dest} timed out"),
                ))
            }
        };
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let dialer = TcpDialer::new();
        let mut conn = dialer.dial(&addr.to_string()).await.unwrap();
        assert!(conn.tcp().is_some());
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(dialer.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::new();
        let Err(err) = dialer.dial(&addr.to_string()).await else {
            panic!("dial to a closed port should fail");
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(dialer.stats().attempted, 1);
        assert_eq!(dialer.stats().succeeded, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dial_unix() {
        let dir = std::env::temp_dir().join(format!("meshgate-dial-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let listener = tokio::net::UnixListener::bind(&dir).unwrap();

        let dialer = TcpDialer::new();
        let conn = dialer
            .dial(&format!("unix:{}", dir.display()))
            .await
            .unwrap();
        assert!(conn.tcp().is_none());
        let _ = listener.accept().await.unwrap();
        let _ = std::fs::remove_file(&dir);
    }
}
