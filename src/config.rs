//! Configuration module for rekindle
//!
//! Configuration is loaded with the following priority (highest first):
//! 1. Command line arguments
//! 2. Environment variables (prefixed with REKINDLE_)
//! 3. Configuration file (config.toml or config.yaml)
//! 4. Default values
//!
//! A relaunched process runs with the same arguments and environment, and
//! reads its configuration file again.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use config::{ConfigError, Environment, File};
use nix::sys::signal::Signal;
use serde::Deserialize;

use crate::listener::DEFAULT_KEEPALIVE;
use crate::signals::SignalMap;

/// Default host to bind to
const DEFAULT_HOST: &str = "0.0.0.0";
/// Default port
const DEFAULT_PORT: u16 = 8080;

/// Command line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "rekindle")]
#[command(about = "An HTTP server that restarts without dropping connections")]
pub struct CliArgs {
    /// Host to bind the server to
    #[arg(long, env = "REKINDLE_HOST")]
    pub host: Option<String>,

    /// Port to bind the server to
    #[arg(short, long, env = "REKINDLE_PORT")]
    pub port: Option<u16>,

    /// TCP keep-alive probe period for accepted connections, in seconds
    #[arg(long, env = "REKINDLE_KEEPALIVE_SECS")]
    pub keepalive_secs: Option<u64>,

    /// Signal that relaunches the server (e.g. SIGUSR1)
    #[arg(long, env = "REKINDLE_RESTART_SIGNAL")]
    pub restart_signal: Option<String>,

    /// Signal that shuts the server down gracefully (e.g. SIGUSR2)
    #[arg(long, env = "REKINDLE_SHUTDOWN_SIGNAL")]
    pub shutdown_signal: Option<String>,

    /// Signal a relaunched process sends its parent once it serves (e.g. SIGHUP)
    #[arg(long, env = "REKINDLE_HANDOFF_SIGNAL")]
    pub handoff_signal: Option<String>,

    /// Path to configuration file
    #[arg(short, long, env = "REKINDLE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// File-based configuration (for TOML/YAML)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    keepalive_secs: Option<u64>,
    restart_signal: Option<String>,
    shutdown_signal: Option<String>,
    handoff_signal: Option<String>,
}

/// Configuration for a rekindle server
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind the server to
    pub host: String,

    /// Port to bind the server to
    pub port: u16,

    /// TCP keep-alive probe period for accepted connections, in seconds
    pub keepalive_secs: u64,

    /// Signals that drive restart, shutdown and handoff
    pub signals: SignalMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            keepalive_secs: DEFAULT_KEEPALIVE.as_secs(),
            signals: SignalMap::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with explicit bind address and default settings
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Load configuration from all sources (CLI > env > file > defaults)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_args(CliArgs::parse())
    }

    /// Load configuration from provided CLI args (for testing)
    pub fn load_from_args(args: CliArgs) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Config::default();

        let file_config = Self::load_file_config(&args.config)?;

        // File overrides defaults, CLI overrides file
        let host = args.host.or(file_config.host);
        let port = args.port.or(file_config.port);
        let keepalive_secs = args.keepalive_secs.or(file_config.keepalive_secs);
        let restart = args.restart_signal.or(file_config.restart_signal);
        let shutdown = args.shutdown_signal.or(file_config.shutdown_signal);
        let handoff = args.handoff_signal.or(file_config.handoff_signal);

        if let Some(h) = host {
            config.host = h;
        }
        if let Some(p) = port {
            config.port = p;
        }
        if let Some(secs) = keepalive_secs {
            config.keepalive_secs = secs;
        }
        if let Some(name) = restart {
            config.signals.restart = parse_signal(&name)?;
        }
        if let Some(name) = shutdown {
            config.signals.shutdown = parse_signal(&name)?;
        }
        if let Some(name) = handoff {
            config.signals.handoff = parse_signal(&name)?;
        }

        config
            .signals
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from file
    fn load_file_config(config_path: &Option<PathBuf>) -> Result<FileConfig, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path.as_path()));
        } else {
            // Try default config files (optional)
            builder = builder
                .add_source(File::with_name("config").required(false))
                .add_source(File::with_name("rekindle").required(false));
        }

        // Add environment variables with REKINDLE_ prefix
        builder = builder.add_source(
            Environment::with_prefix("REKINDLE")
                .separator("_")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        settings.try_deserialize()
    }

    /// Get the socket address for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Keep-alive probe period for accepted connections
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// Parse a signal name such as `SIGUSR1`; the `SIG` prefix is optional.
fn parse_signal(name: &str) -> Result<Signal, ConfigError> {
    let name = name.trim().to_ascii_uppercase();
    let full = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{}", name)
    };
    Signal::from_str(&full).map_err(|_| ConfigError::Message(format!("unknown signal: {}", full)))
}
