use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use warp::hyper::server::conn::AddrStream;

/// When bytes last arrived on a socket.
///
/// Updated from the transport, so a large frame that is still trickling in
/// counts as traffic long before the WebSocket layer yields it.
#[derive(Debug, Clone)]
pub struct Activity {
    origin: Instant,
    last_read_ms: Arc<AtomicU64>,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_read_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        self.last_read_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last inbound byte (or since creation).
    pub fn idle(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_read_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// An accepted connection that records read activity.
pub struct ActivityIo<T> {
    inner: T,
    activity: Activity,
}

impl<T> ActivityIo<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            activity: Activity::new(),
        }
    }

    pub fn activity(&self) -> Activity {
        self.activity.clone()
    }
}

impl ActivityIo<AddrStream> {
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ActivityIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if buf.filled().len() > before {
            this.activity.touch();
        }
        res
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ActivityIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn reads_reset_the_idle_clock() {
        let (client, server) = tokio::io::duplex(64);
        let mut io = ActivityIo::new(server);
        let activity = io.activity();
        let mut client = client;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(activity.idle() >= Duration::from_millis(30));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert!(activity.idle() < Duration::from_millis(30));
    }

    #[tokio::test]
    async fn writes_do_not_count_as_activity() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut io = ActivityIo::new(server);
        let activity = io.activity();

        tokio::time::sleep(Duration::from_millis(30)).await;
        io.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert!(activity.idle() >= Duration::from_millis(30));
    }
}
