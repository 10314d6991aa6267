//! Signal handling for restart and shutdown.
//!
//! Three signals drive the server lifecycle:
//! - restart (default SIGUSR1): spawn a replacement process that inherits
//!   the listening socket
//! - shutdown (default SIGUSR2): stop accepting and drain in-flight connections
//! - handoff (default SIGHUP): sent by a replacement to its parent once it is
//!   serving; the parent then shuts down
//!
//! Signals are received by [`SignalSource`] and handled one at a time by
//! [`SignalDispatcher`].

use std::io;

use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::relaunch::RelaunchError;
use crate::server::ServerHandle;

/// Capacity of the queue between signal streams and the dispatcher.
const SIGNAL_QUEUE_SIZE: usize = 16;

/// What a received signal asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Restart,
    Shutdown,
    HandoffComplete,
}

/// A [`SignalMap`] that cannot drive the lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalMapError {
    #[error("restart ({restart}), shutdown ({shutdown}) and handoff ({handoff}) signals must be distinct")]
    SharedSignal {
        restart: Signal,
        shutdown: Signal,
        handoff: Signal,
    },
}

/// Which signal maps to which [`Trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalMap {
    pub restart: Signal,
    pub shutdown: Signal,
    pub handoff: Signal,
}

impl Default for SignalMap {
    fn default() -> Self {
        Self {
            restart: Signal::SIGUSR1,
            shutdown: Signal::SIGUSR2,
            handoff: Signal::SIGHUP,
        }
    }
}

impl SignalMap {
    /// Map a raw signal number to its trigger, if any.
    pub fn classify(&self, signum: i32) -> Option<Trigger> {
        match Signal::try_from(signum).ok()? {
            s if s == self.restart => Some(Trigger::Restart),
            s if s == self.shutdown => Some(Trigger::Shutdown),
            s if s == self.handoff => Some(Trigger::HandoffComplete),
            _ => None,
        }
    }

    pub fn signals(&self) -> [Signal; 3] {
        [self.restart, self.shutdown, self.handoff]
    }

    /// Reject maps where two roles share a signal.
    pub fn validate(&self) -> Result<(), SignalMapError> {
        let [restart, shutdown, handoff] = self.signals();
        if restart == shutdown || restart == handoff || shutdown == handoff {
            return Err(SignalMapError::SharedSignal {
                restart,
                shutdown,
                handoff,
            });
        }
        Ok(())
    }
}

/// OS signal handlers for every signal in a [`SignalMap`].
///
/// Handlers are installed by [`register`](Self::register); signals arriving
/// before [`forward`](Self::forward) is called are buffered, not lost.
#[derive(Debug)]
pub struct SignalSource {
    streams: Vec<(i32, tokio::signal::unix::Signal)>,
}

impl SignalSource {
    /// Install handlers. Must be called from within a tokio runtime.
    pub fn register(map: &SignalMap) -> io::Result<Self> {
        let streams = map
            .signals()
            .into_iter()
            .map(|sig| {
                let signum = sig as i32;
                signal(SignalKind::from_raw(signum)).map(|stream| (signum, stream))
            })
            .collect::<io::Result<_>>()?;
        Ok(Self { streams })
    }

    /// Forward received signal numbers into a channel, in arrival order per
    /// signal.
    pub fn forward(self) -> mpsc::Receiver<i32> {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_SIZE);
        for (signum, mut stream) in self.streams {
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(signum).await.is_err() {
                        break;
                    }
                }
            });
        }
        rx
    }
}

/// Routes received signals to the server.
#[derive(Debug)]
pub struct SignalDispatcher {
    map: SignalMap,
    server: ServerHandle,
}

impl SignalDispatcher {
    pub fn new(map: SignalMap, server: ServerHandle) -> Self {
        Self { map, server }
    }

    /// Handle signals until the channel closes, which for OS signals means
    /// never.
    pub async fn run(self, mut signals: mpsc::Receiver<i32>) {
        while let Some(signum) = signals.recv().await {
            self.dispatch(signum);
        }
        tracing::debug!("Signal channel closed, dispatcher stopping");
    }

    /// Handle one signal to completion.
    ///
    /// A relaunch whose child process cannot be created terminates this
    /// process with exit status 1.
    pub fn dispatch(&self, signum: i32) -> Option<Trigger> {
        let pid = std::process::id();
        let trigger = self.map.classify(signum);

        match trigger {
            Some(Trigger::Restart) => {
                tracing::info!(pid, "Received restart signal, relaunching");
                match self.server.relaunch() {
                    Ok(child_pid) => {
                        tracing::info!(pid, child_pid, "Relaunch started, waiting for handoff");
                    }
                    Err(e @ RelaunchError::Spawn { .. }) => {
                        tracing::error!(pid, "Relaunch failed, exiting: {}", e);
                        std::process::exit(1);
                    }
                    Err(e) => {
                        tracing::warn!(pid, "Restart rejected: {}", e);
                    }
                }
            }
            Some(Trigger::Shutdown) => {
                tracing::info!(pid, "Received shutdown signal");
                self.server.shutdown();
            }
            Some(Trigger::HandoffComplete) => {
                tracing::info!(pid, "Received handoff confirmation");
                self.server.handoff_complete();
            }
            None => {
                let name = Signal::try_from(signum).map_or("unknown", Signal::as_str);
                tracing::info!(pid, signum, "Received {}: nothing to do", name);
            }
        }

        trigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::time::Duration;

    use axum::Router;
    use tokio::time::timeout;

    use crate::config::Config;
    use crate::relaunch::LaunchCommand;
    use crate::server::{Server, ServerState};

    async fn running_server() -> (ServerHandle, tokio::task::JoinHandle<()>) {
        let config = Config::new("127.0.0.1", 0);
        let server = Server::bind_with(
            &config,
            Router::new(),
            LaunchCommand::new("true", Vec::<OsString>::new()),
        )
        .await
        .unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move { server.serve().await.unwrap() });

        for _ in 0..100 {
            if handle.state() == ServerState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.state(), ServerState::Running);
        (handle, task)
    }

    #[test]
    fn test_default_map() {
        let map = SignalMap::default();
        assert_eq!(map.restart, Signal::SIGUSR1);
        assert_eq!(map.shutdown, Signal::SIGUSR2);
        assert_eq!(map.handoff, Signal::SIGHUP);
        assert!(map.validate().is_ok());
    }

    #[test]
    fn test_classify() {
        let map = SignalMap::default();
        assert_eq!(map.classify(Signal::SIGUSR1 as i32), Some(Trigger::Restart));
        assert_eq!(map.classify(Signal::SIGUSR2 as i32), Some(Trigger::Shutdown));
        assert_eq!(
            map.classify(Signal::SIGHUP as i32),
            Some(Trigger::HandoffComplete)
        );
        assert_eq!(map.classify(Signal::SIGTERM as i32), None);
        assert_eq!(map.classify(-1), None);
    }

    #[test]
    fn test_validate_rejects_shared_signal() {
        let map = SignalMap {
            handoff: Signal::SIGUSR2,
            ..SignalMap::default()
        };
        let err = map.validate().unwrap_err();
        assert_eq!(
            err,
            SignalMapError::SharedSignal {
                restart: Signal::SIGUSR1,
                shutdown: Signal::SIGUSR2,
                handoff: Signal::SIGUSR2,
            }
        );
        assert!(err.to_string().contains("SIGUSR2"));
    }

    #[tokio::test]
    async fn test_register_installs_handlers() {
        let source = SignalSource::register(&SignalMap::default()).unwrap();
        assert_eq!(source.streams.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_signal_is_ignored() {
        let (handle, _task) = running_server().await;
        let dispatcher = SignalDispatcher::new(SignalMap::default(), handle.clone());

        assert_eq!(dispatcher.dispatch(Signal::SIGWINCH as i32), None);
        assert_eq!(handle.state(), ServerState::Running);
        assert!(!handle.has_relaunched());
    }

    #[tokio::test]
    async fn test_repeated_shutdown_closes_once() {
        let (handle, task) = running_server().await;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(SignalDispatcher::new(SignalMap::default(), handle.clone()).run(rx));

        for _ in 0..3 {
            tx.send(Signal::SIGUSR2 as i32).await.unwrap();
        }

        timeout(Duration::from_secs(2), task)
            .await
            .expect("server should terminate after shutdown")
            .unwrap();
        assert_eq!(handle.state(), ServerState::Terminate);
    }

    #[tokio::test]
    async fn test_repeated_restart_relaunches_once() {
        let (handle, _task) = running_server().await;
        let dispatcher = SignalDispatcher::new(SignalMap::default(), handle.clone());

        assert_eq!(
            dispatcher.dispatch(Signal::SIGUSR1 as i32),
            Some(Trigger::Restart)
        );
        assert!(handle.has_relaunched());
        assert!(matches!(
            handle.relaunch(),
            Err(RelaunchError::AlreadyRelaunched)
        ));

        // The rejected second restart leaves the server running.
        dispatcher.dispatch(Signal::SIGUSR1 as i32);
        assert_eq!(handle.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn test_handoff_without_relaunch_is_ignored() {
        let (handle, _task) = running_server().await;
        let dispatcher = SignalDispatcher::new(SignalMap::default(), handle.clone());

        dispatcher.dispatch(Signal::SIGHUP as i32);
        assert_eq!(handle.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn test_handoff_after_relaunch_shuts_down() {
        let (handle, task) = running_server().await;
        let dispatcher = SignalDispatcher::new(SignalMap::default(), handle.clone());

        dispatcher.dispatch(Signal::SIGUSR1 as i32);
        dispatcher.dispatch(Signal::SIGHUP as i32);

        timeout(Duration::from_secs(2), task)
            .await
            .expect("server should terminate after handoff")
            .unwrap();
        assert_eq!(handle.state(), ServerState::Terminate);
    }
}
