//! Shared test utilities and helpers for rekindle tests.
//!
//! This module provides common functionality used across integration tests.

#![allow(dead_code)]

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use rekindle::config::Config;
use rekindle::relaunch::LaunchCommand;
use rekindle::{Server, ServerError, ServerHandle, ServerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// How long polling helpers wait before failing a test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A server running on a background task, bound to an ephemeral local port.
pub struct TestServer {
    pub handle: ServerHandle,
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    /// Binds and starts serving `router`. Restarts spawn `true` instead of
    /// the test binary.
    pub async fn start(router: Router) -> Self {
        let server = Server::bind_with(
            &Config::new("127.0.0.1", 0),
            router,
            LaunchCommand::new("true", Vec::<OsString>::new()),
        )
        .await
        .expect("Failed to bind test server");
        let handle = server.handle();
        let addr = server.local_addr();
        let task = tokio::spawn(server.serve());

        let running = handle.clone();
        wait_until("server running", || running.state() == ServerState::Running).await;

        Self { handle, addr, task }
    }
}

/// Returns a local port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind port finder");
    listener.local_addr().unwrap().port()
}

/// Polls `condition` until it holds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Polls an async check until it yields a value, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_for<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Sends a bare HTTP/1.1 GET and returns the raw response once the server
/// closes the connection.
pub async fn raw_get(addr: SocketAddr, path: &str) -> io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}
