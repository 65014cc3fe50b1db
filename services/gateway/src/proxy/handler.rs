//! In-process stream handlers.

use std::io;

use async_trait::async_trait;
use tracing::debug;

use super::stream::Stream;

/// Owns a classified stream instead of the proxy loop.
///
/// The dispatcher has already sent any deferred protocol reply (SOCKS5,
/// CONNECT) with a success outcome before the handler runs.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: Stream) -> io::Result<()>;
}

/// Writes every byte back to the sender, then half-closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl StreamHandler for EchoHandler {
    async fn handle(&self, mut stream: Stream) -> io::Result<()> {
        let echoed = {
            let (mut reader, mut writer) = tokio::io::split(stream.transport_mut());
            tokio::io::copy(&mut reader, &mut writer).await?
        };
        stream.close_write().await?;
        debug!(stream_id = stream.id(), echoed, "echo finished");
        stream.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::stream::{next_stream_id, StreamMeta, StreamStats};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_echo_until_eof() {
        let (a, mut b) = tokio::io::duplex(1024);
        let stats = StreamStats::new(next_stream_id());
        let stream = Stream::new(StreamMeta::new(std::sync::Arc::clone(&stats)), Box::new(a));
        let task = tokio::spawn(async move { EchoHandler.handle(stream).await });

        b.write_all(b"marco").await.unwrap();
        b.shutdown().await.unwrap();
        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"marco");
        task.await.unwrap().unwrap();
        assert!(stats.client_closed());
        assert!(stats.is_closed());
    }
}
