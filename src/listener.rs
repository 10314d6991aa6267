//! Listening socket that can be handed to a relaunched process.
//!
//! A fresh process binds its own socket. A relaunched process finds the
//! parent's listening socket already open at [`INHERITED_LISTENER_FD`], the
//! first descriptor after stdin, stdout and stderr, and adopts it instead of
//! binding. The parent keeps its own copy open until it closes the listener
//! during shutdown, so the port never stops accepting connections.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{getsockopt, sockopt, SockType};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::tracker::{ConnectionTracker, TrackedStream};

/// Descriptor slot a relaunched process finds its listening socket in.
pub const INHERITED_LISTENER_FD: RawFd = 3;

/// Keep-alive probe period applied to accepted connections (3 minutes).
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(180);

/// Errors produced by [`HandoffListener`].
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Binding a fresh socket failed.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The inherited descriptor is missing or is not a listening TCP socket.
    #[error("failed to inherit listener from descriptor {fd}: {source}")]
    Inherit {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// `close` was called on a listener that is already closed.
    #[error("listener already closed")]
    AlreadyClosed,

    /// The listener was closed; no further connections will be accepted.
    #[error("listener closed")]
    Closed,

    /// The OS rejected an accept call.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// TCP listener whose socket can be passed to a child process.
///
/// Every accepted connection gets TCP keep-alive enabled and is registered
/// with the shared [`ConnectionTracker`] until the returned
/// [`TrackedStream`] is dropped.
#[derive(Debug)]
pub struct HandoffListener {
    socket: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    stopped: AtomicBool,
    closed: watch::Sender<bool>,
    tracker: ConnectionTracker,
    keepalive: Duration,
}

impl HandoffListener {
    /// Bind a new listening socket on `addr`.
    pub async fn bind(
        addr: &str,
        tracker: ConnectionTracker,
        keepalive: Duration,
    ) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        Self::from_listener(listener, tracker, keepalive).map_err(bind_err)
    }

    /// Adopt the listening socket a parent process left at
    /// [`INHERITED_LISTENER_FD`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn inherit(tracker: ConnectionTracker, keepalive: Duration) -> Result<Self, ListenerError> {
        let inherit_err = |source| ListenerError::Inherit {
            fd: INHERITED_LISTENER_FD,
            source,
        };

        check_listening_socket(INHERITED_LISTENER_FD).map_err(inherit_err)?;

        // SAFETY: the descriptor was verified above to be an open listening
        // stream socket, and nothing else in this process claims it.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(INHERITED_LISTENER_FD) };

        fcntl(
            INHERITED_LISTENER_FD,
            FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC),
        )
        .map_err(|errno| inherit_err(errno.into()))?;
        std_listener.set_nonblocking(true).map_err(inherit_err)?;

        let listener = TcpListener::from_std(std_listener).map_err(inherit_err)?;
        Self::from_listener(listener, tracker, keepalive).map_err(inherit_err)
    }

    /// Inherit when `inherited` is set, otherwise bind `addr`.
    pub async fn acquire(
        addr: &str,
        inherited: bool,
        tracker: ConnectionTracker,
        keepalive: Duration,
    ) -> Result<Self, ListenerError> {
        if inherited {
            Self::inherit(tracker, keepalive)
        } else {
            Self::bind(addr, tracker, keepalive).await
        }
    }

    /// Wrap an already-bound tokio listener.
    pub fn from_listener(
        listener: TcpListener,
        tracker: ConnectionTracker,
        keepalive: Duration,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (closed, _) = watch::channel(false);

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            stopped: AtomicBool::new(false),
            closed,
            tracker,
            keepalive,
        })
    }

    /// Wait for the next connection.
    ///
    /// Returns [`ListenerError::Closed`] once [`close`](Self::close) has been
    /// called, including when the close happens while this call is pending.
    pub async fn accept(&self) -> Result<(TrackedStream, SocketAddr), ListenerError> {
        // Subscribe before checking the flag so a concurrent close is never missed.
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ListenerError::Closed);
        }
        let socket = self.socket()?;

        tokio::select! {
            biased;
            _ = closed.changed() => Err(ListenerError::Closed),
            accepted = socket.accept() => {
                let (stream, peer) = accepted.map_err(ListenerError::Accept)?;
                self.enable_keepalive(&stream);
                Ok((TrackedStream::new(stream, self.tracker.register()), peer))
            }
        }
    }

    /// The socket to hand to a child process.
    ///
    /// The returned handle keeps the socket open for as long as it lives and
    /// does not affect this process's use of it.
    pub fn inheritable(&self) -> Result<InheritableSocket, ListenerError> {
        Ok(InheritableSocket {
            listener: self.socket()?,
        })
    }

    /// Stop accepting connections.
    ///
    /// Only the first call has an effect. Later calls return
    /// [`ListenerError::AlreadyClosed`] and do nothing.
    pub fn close(&self) -> Result<(), ListenerError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyClosed);
        }
        self.closed.send_replace(true);
        // A pending accept holds its own reference; the descriptor is
        // released once that accept observes the close.
        drop(
            self.socket
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn socket(&self) -> Result<Arc<TcpListener>, ListenerError> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ListenerError::Closed)
    }

    fn enable_keepalive(&self, stream: &TcpStream) {
        let keepalive = TcpKeepalive::new().with_time(self.keepalive);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
        let keepalive = keepalive.with_interval(self.keepalive);

        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!("Failed to enable keep-alive on accepted connection: {}", e);
        }
    }
}

/// Capability to pass the listening socket across a process spawn.
///
/// The child finds it at [`INHERITED_LISTENER_FD`].
#[derive(Debug, Clone)]
pub struct InheritableSocket {
    listener: Arc<TcpListener>,
}

impl AsRawFd for InheritableSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Verify `fd` is an open stream socket in the listening state without
/// taking ownership of it.
fn check_listening_socket(fd: RawFd) -> io::Result<()> {
    // SAFETY: the borrow does not outlive this function and never closes `fd`.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

    if getsockopt(&borrowed, sockopt::SockType)? != SockType::Stream {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "inherited descriptor is not a stream socket",
        ));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if !getsockopt(&borrowed, sockopt::AcceptConn)? {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "inherited socket is not listening",
        ));
    }

    Ok(())
}
