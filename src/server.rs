//! Server lifecycle: bind or inherit, serve, drain.
//!
//! ```text
//! INIT --serve--> RUNNING --shutdown--> SHUTTING_DOWN --drained--> TERMINATE
//! ```
//!
//! Transitions only move forward and are compare-and-swap operations, so
//! duplicate or out-of-order triggers are no-ops.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::listener::{HandoffListener, ListenerError};
use crate::relaunch::{inheritance_marker_present, LaunchCommand, RelaunchError, Relauncher};
use crate::signals::{SignalDispatcher, SignalMap, SignalSource};
use crate::tracker::{ConnectionTracker, TrackedStream};

/// Pause after an accept error that is not specific to one connection.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Init = 0,
    Running = 1,
    ShuttingDown = 2,
    Terminate = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Terminate,
        }
    }
}

/// Errors that stop a server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to register signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error("failed to determine the relaunch command line: {0}")]
    LaunchCommand(#[source] io::Error),

    #[error("server cannot start serving from state {0:?}")]
    InvalidState(ServerState),
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    listener: HandoffListener,
    tracker: ConnectionTracker,
    relauncher: Relauncher,
    inherited: bool,
    draining: watch::Sender<bool>,
}

/// Cloneable control handle for a server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Stop accepting connections and let in-flight ones finish.
    ///
    /// Acts only when the server is `Running`; returns whether this call
    /// started the shutdown.
    pub fn shutdown(&self) -> bool {
        let pid = std::process::id();
        if !self.transition(ServerState::Running, ServerState::ShuttingDown) {
            tracing::debug!(pid, state = ?self.state(), "Shutdown ignored, server not running");
            return false;
        }

        // Live connections stop keeping alive once their current request is done.
        self.shared.draining.send_replace(true);

        let addr = self.shared.listener.local_addr();
        match self.shared.listener.close() {
            Ok(()) => tracing::info!(pid, %addr, "Listener closed"),
            Err(e) => tracing::warn!(pid, %addr, "Listener close error: {}", e),
        }
        true
    }

    /// Spawn a replacement process that inherits the listening socket.
    pub fn relaunch(&self) -> Result<u32, RelaunchError> {
        self.shared
            .relauncher
            .relaunch(|| self.shared.listener.inheritable())
    }

    /// Handle a replacement process reporting that it is serving.
    ///
    /// Shuts this server down, unless this process never relaunched, in which
    /// case the confirmation is not meant for it and is ignored.
    pub fn handoff_complete(&self) -> bool {
        if !self.has_relaunched() {
            tracing::warn!(
                pid = std::process::id(),
                "Ignoring handoff confirmation, no relaunch in progress"
            );
            return false;
        }
        self.shutdown()
    }

    pub fn active_connections(&self) -> usize {
        self.shared.tracker.count()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.listener.local_addr()
    }

    /// Whether this process adopted a listening socket from its parent.
    pub fn was_inherited(&self) -> bool {
        self.shared.inherited
    }

    pub fn has_relaunched(&self) -> bool {
        self.shared.relauncher.has_relaunched()
    }

    fn transition(&self, from: ServerState, to: ServerState) -> bool {
        self.shared
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A bound server that has not started serving yet.
#[derive(Debug)]
pub struct Server {
    handle: ServerHandle,
    router: Router,
    signals: SignalSource,
    signal_map: SignalMap,
}

impl Server {
    /// Register signal handlers, then bind `config.bind_addr()` or adopt the
    /// inherited socket if this process was relaunched.
    pub async fn bind(config: &Config, router: Router) -> Result<Self, ServerError> {
        let command = LaunchCommand::current().map_err(ServerError::LaunchCommand)?;
        Self::bind_with(config, router, command).await
    }

    /// Like [`bind`](Self::bind), relaunching with `command` instead of the
    /// current command line.
    pub async fn bind_with(
        config: &Config,
        router: Router,
        command: LaunchCommand,
    ) -> Result<Self, ServerError> {
        let signals = SignalSource::register(&config.signals).map_err(ServerError::Signals)?;

        let pid = std::process::id();
        let inherited = inheritance_marker_present();
        let tracker = ConnectionTracker::new();
        let listener = HandoffListener::acquire(
            &config.bind_addr(),
            inherited,
            tracker.clone(),
            config.keepalive(),
        )
        .await?;

        if inherited {
            tracing::info!(pid, addr = %listener.local_addr(), "Inherited listener from parent");
        } else {
            tracing::info!(pid, addr = %listener.local_addr(), "Bound new listener");
        }

        let (draining, _) = watch::channel(false);
        let shared = Shared {
            state: AtomicU8::new(ServerState::Init as u8),
            listener,
            tracker,
            relauncher: Relauncher::new(command),
            inherited,
            draining,
        };

        Ok(Self {
            handle: ServerHandle {
                shared: Arc::new(shared),
            },
            router,
            signals,
            signal_map: config.signals,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Serve until shut down, then wait for every connection to close.
    pub async fn serve(self) -> Result<(), ServerError> {
        let Self {
            handle,
            router,
            signals,
            signal_map,
        } = self;
        let pid = std::process::id();

        if !handle.transition(ServerState::Init, ServerState::Running) {
            return Err(ServerError::InvalidState(handle.state()));
        }
        tracing::info!(pid, addr = %handle.local_addr(), "Server running");

        let dispatcher = SignalDispatcher::new(signal_map, handle.clone());
        tokio::spawn(dispatcher.run(signals.forward()));

        if handle.was_inherited() {
            notify_parent(signal_map.handoff);
        }

        accept_loop(&handle, router).await;

        tracing::info!(
            pid,
            active = handle.active_connections(),
            "Waiting for connections to drain"
        );
        handle.shared.tracker.wait().await;

        handle
            .shared
            .state
            .store(ServerState::Terminate as u8, Ordering::SeqCst);
        tracing::info!(pid, "All connections closed, server terminated");
        Ok(())
    }
}

/// Bind or inherit a listener for `config`, then serve `router` on it until
/// shut down and drained.
pub async fn start(config: &Config, router: Router) -> Result<(), ServerError> {
    Server::bind(config, router).await?.serve().await
}

async fn accept_loop(handle: &ServerHandle, router: Router) {
    loop {
        let (stream, peer) = match handle.shared.listener.accept().await {
            Ok(accepted) => accepted,
            Err(ListenerError::Closed) => break,
            Err(ListenerError::Accept(e)) if is_connection_error(&e) => {
                tracing::debug!("Connection failed during accept: {}", e);
                continue;
            }
            Err(e) => {
                tracing::error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        tracing::trace!(%peer, "Accepted connection");
        let draining = handle.shared.draining.subscribe();
        tokio::spawn(serve_connection(stream, router.clone(), draining));
    }
}

/// Run the HTTP collaborator on one connection, asking it to finish up once
/// the server starts draining.
async fn serve_connection(
    stream: TrackedStream,
    router: Router,
    mut draining: watch::Receiver<bool>,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::pin!(conn);

    let mut draining_seen = *draining.borrow_and_update();
    if draining_seen {
        conn.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!("Connection error: {}", e);
                }
                break;
            }
            _ = draining.changed(), if !draining_seen => {
                draining_seen = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Tell the parent process this one has taken over the listener.
fn notify_parent(signal: Signal) {
    let pid = std::process::id();
    let Some(parent) = handoff_target(getppid()) else {
        tracing::warn!(
            pid,
            "Parent already exited, not sending handoff confirmation to init"
        );
        return;
    };
    match kill(parent, signal) {
        Ok(()) => tracing::info!(
            pid,
            parent_pid = parent.as_raw(),
            signal = signal.as_str(),
            "Notified parent that handoff is complete"
        ),
        Err(e) => tracing::warn!(
            pid,
            parent_pid = parent.as_raw(),
            "Failed to notify parent of handoff: {}",
            e
        ),
    }
}

/// The process to confirm a handoff to. An orphaned process is reparented to
/// init, which must never receive the confirmation.
fn handoff_target(parent: Pid) -> Option<Pid> {
    (parent.as_raw() > 1).then_some(parent)
}
