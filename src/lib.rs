//! rekindle - zero-downtime restarts for long-running HTTP servers
//!
//! A running server hands its listening socket to a freshly spawned copy of
//! itself, stops accepting, and exits once its in-flight connections finish.

pub mod config;
pub mod listener;
pub mod relaunch;
pub mod server;
pub mod signals;
pub mod tracker;

pub use server::{start, Server, ServerError, ServerHandle, ServerState};
