//! In-flight connection accounting.
//!
//! Every accepted connection is registered with a [`ConnectionTracker`] and
//! deregistered when its [`TrackedStream`] is dropped. Shutdown waits on
//! [`ConnectionTracker::wait`] until the count returns to zero.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Shared counter of accepted-but-not-yet-closed connections.
///
/// Cloning is cheap; all clones observe the same count.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    count: Arc<watch::Sender<usize>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Record one more open connection.
    pub fn add(&self) {
        self.count.send_modify(|count| *count += 1);
    }

    /// Record that a connection has closed.
    ///
    /// Must be paired with an earlier [`add`](Self::add). An unpaired call is
    /// a bug in the caller; release builds clamp the count at zero.
    pub fn done(&self) {
        self.count.send_modify(|count| {
            debug_assert!(*count > 0, "ConnectionTracker::done without matching add");
            *count = count.saturating_sub(1);
        });
    }

    /// Current number of open connections.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Register a connection and return a guard that calls [`done`](Self::done)
    /// exactly once, when dropped.
    pub fn register(&self) -> ConnectionGuard {
        self.add();
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    /// Wait until every registered connection has closed.
    ///
    /// Completes immediately when nothing is open.
    pub async fn wait(&self) {
        let mut count = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = count.wait_for(|open| *open == 0).await;
    }
}

/// Holds one slot in a [`ConnectionTracker`] for as long as it lives.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.done();
    }
}

/// An accepted TCP connection that stays counted until it is dropped.
#[derive(Debug)]
pub struct TrackedStream {
    stream: TcpStream,
    _guard: ConnectionGuard,
}

impl TrackedStream {
    pub fn new(stream: TcpStream, guard: ConnectionGuard) -> Self {
        Self {
            stream,
            _guard: guard,
        }
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test]
    fn test_add_and_done_balance() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.count(), 0);

        tracker.add();
        tracker.add();
        assert_eq!(tracker.count(), 2);

        tracker.done();
        assert_eq!(tracker.count(), 1);
        tracker.done();
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_clones_share_count() {
        let tracker = ConnectionTracker::new();
        let clone = tracker.clone();

        tracker.add();
        assert_eq!(clone.count(), 1);
        clone.done();
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_guard_releases_once_on_drop() {
        let tracker = ConnectionTracker::new();
        let first = tracker.register();
        let second = tracker.register();
        assert_eq!(tracker.count(), 2);

        drop(first);
        assert_eq!(tracker.count(), 1);
        drop(second);
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let tracker = ConnectionTracker::new();
        let result = timeout(Duration::from_millis(100), tracker.wait()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_last_connection_closes() {
        let tracker = ConnectionTracker::new();
        let guards: Vec<_> = (0..3).map(|_| tracker.register()).collect();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };

        let mut guards = guards.into_iter();
        for _ in 0..2 {
            drop(guards.next());
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!waiter.is_finished(), "wait returned with connections open");
        }

        drop(guards.next());
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish after the last close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_tracked_stream_forwards_io_and_releases_on_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tracker = ConnectionTracker::new();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let mut tracked = TrackedStream::new(server_side, tracker.register());
        assert_eq!(tracker.count(), 1);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tracked.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        tracked.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(tracked);
        assert_eq!(tracker.count(), 0);
    }
}
