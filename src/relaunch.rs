//! Spawning the replacement process.
//!
//! The child runs the same program with the same arguments, inherits stdout
//! and stderr, reads stdin from `/dev/null`, and receives the listening socket at
//! [`INHERITED_LISTENER_FD`]. The environment marker
//! `REKINDLE_HANDOFF=inherited-listener` tells it to adopt that socket
//! instead of binding a new one.

use std::env;
use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::PoisonError;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::dup2;
use thiserror::Error;
use tokio::process::Command;

use crate::listener::{InheritableSocket, ListenerError, INHERITED_LISTENER_FD};

/// Environment variable marking a process as started by a relaunch.
pub const HANDOFF_ENV_KEY: &str = "REKINDLE_HANDOFF";
/// Value [`HANDOFF_ENV_KEY`] must hold for the marker to count.
pub const HANDOFF_ENV_VALUE: &str = "inherited-listener";

/// Whether the current process was started by a relaunch and should adopt
/// the inherited listening socket.
pub fn inheritance_marker_present() -> bool {
    env::var_os(HANDOFF_ENV_KEY).is_some_and(|value| value == HANDOFF_ENV_VALUE)
}

/// Errors produced by [`Relauncher::relaunch`].
#[derive(Debug, Error)]
pub enum RelaunchError {
    /// This process has already started its replacement.
    #[error("the process already relaunched")]
    AlreadyRelaunched,

    /// The listening socket could not be handed over.
    #[error("listening socket unavailable: {0}")]
    Listener(#[from] ListenerError),

    /// The child process could not be created.
    #[error("failed to spawn replacement process {program:?}: {source}")]
    Spawn {
        program: OsString,
        #[source]
        source: io::Error,
    },
}

/// Program and arguments a relaunch executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl LaunchCommand {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The command line of the current process.
    ///
    /// Uses `argv[0]` rather than the resolved executable so a binary that
    /// was replaced on disk is the one that gets started.
    pub fn current() -> io::Result<Self> {
        let mut argv = env::args_os();
        let program = match argv.next() {
            Some(program) => program,
            None => env::current_exe()?.into_os_string(),
        };
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }
}

/// Starts at most one replacement process per process lifetime.
#[derive(Debug)]
pub struct Relauncher {
    command: LaunchCommand,
    has_relaunched: Mutex<bool>,
}

impl Relauncher {
    pub fn new(command: LaunchCommand) -> Self {
        Self {
            command,
            has_relaunched: Mutex::new(false),
        }
    }

    /// Whether a relaunch has been initiated by this process.
    pub fn has_relaunched(&self) -> bool {
        *self
            .has_relaunched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the replacement process and hand it `socket`.
    ///
    /// Returns the child's pid. Only the first call spawns anything; every
    /// later call fails with [`RelaunchError::AlreadyRelaunched`].
    ///
    /// Must be called from within a tokio runtime; a background task reaps
    /// the child and logs its exit status.
    pub fn relaunch<F>(&self, socket: F) -> Result<u32, RelaunchError>
    where
        F: FnOnce() -> Result<InheritableSocket, ListenerError>,
    {
        {
            let mut has_relaunched = self
                .has_relaunched
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *has_relaunched {
                return Err(RelaunchError::AlreadyRelaunched);
            }
            *has_relaunched = true;
        }

        let socket = socket()?;
        let fd = socket.as_raw_fd();

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .env(HANDOFF_ENV_KEY, HANDOFF_ENV_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: `place_inherited_listener` only issues dup2/fcntl, which are
        // async-signal-safe, and allocates nothing.
        unsafe {
            cmd.pre_exec(move || place_inherited_listener(fd));
        }

        let mut child = cmd.spawn().map_err(|source| RelaunchError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        // The child holds its own copy of the descriptor now.
        drop(socket);

        let pid = child.id().unwrap_or_default();
        tracing::info!(child_pid = pid, "Spawned replacement process");

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!(child_pid = pid, "Replacement process exited");
                }
                Ok(status) => {
                    tracing::error!(child_pid = pid, %status, "Replacement process failed");
                }
                Err(e) => {
                    tracing::warn!(child_pid = pid, "Failed to wait for replacement process: {}", e);
                }
            }
        });

        Ok(pid)
    }
}

/// Runs in the forked child before exec: put the listening socket at
/// [`INHERITED_LISTENER_FD`] with close-on-exec cleared.
fn place_inherited_listener(fd: RawFd) -> io::Result<()> {
    if fd == INHERITED_LISTENER_FD {
        // dup2 onto itself is a no-op that keeps FD_CLOEXEC set.
        let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
        fcntl(fd, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;
    } else {
        dup2(fd, INHERITED_LISTENER_FD)?;
    }
    Ok(())
}
