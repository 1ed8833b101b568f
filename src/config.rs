//! Environment-driven configuration for the relay.
//!
//! A small `parse_env_var!` macro drives DRY env-var loading onto a
//! `Default` baseline, with a `from_file` TOML path kept for parity even
//! though environment variables are the primary surface.

use std::env;

use serde::Deserialize;

use crate::error::{Error, Result};

macro_rules! parse_env_var {
    ($config:ident, $field:ident, $env_var:expr, $ty:ty) => {
        if let Ok(value) = env::var($env_var) {
            $config.$field = value
                .parse::<$ty>()
                .map_err(|_| Error::configuration(concat!("invalid ", $env_var)))?;
        }
    };

    ($config:ident, $field:ident, $env_var:expr) => {
        if let Ok(value) = env::var($env_var) {
            $config.$field = value;
        }
    };

    (opt $config:ident, $field:ident, $env_var:expr) => {
        if let Ok(value) = env::var($env_var) {
            $config.$field = Some(value);
        }
    };
}

/// Default port the relay listens on.
pub const DEFAULT_PORT: u16 = 19988;

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Host address to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Bearer token required on the WebSocket upgrade, if set.
    pub auth_token: Option<String>,

    /// Path to a log file. Falls back to stderr when unset.
    pub log_file: Option<String>,

    /// Whether the lifecycle supervisor should ask the platform to open the
    /// spawned process's window separately rather than inheriting the
    /// parent's console (relevant on Windows; ignored elsewhere).
    pub separate_window: bool,

    /// Milliseconds the lifecycle supervisor waits for a version probe
    /// before declaring the port unreachable.
    pub probe_timeout_ms: u64,

    /// Milliseconds between readiness polls while waiting for a freshly
    /// spawned relay (or the extension) to come up.
    pub poll_interval_ms: u64,

    /// Milliseconds the lifecycle supervisor waits in total for a freshly
    /// spawned relay to become ready before giving up.
    pub start_timeout_ms: u64,

    /// Milliseconds the extension wait utility waits in total for the
    /// extension to connect and report at least one page.
    pub extension_wait_timeout_ms: u64,

    /// Log verbosity, passed through to `tracing_subscriber::EnvFilter`.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            auth_token: None,
            log_file: None,
            separate_window: false,
            probe_timeout_ms: 500,
            poll_interval_ms: 100,
            start_timeout_ms: 10_000,
            extension_wait_timeout_ms: 30_000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// `Default` for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        parse_env_var!(config, host, "RELAY_HOST");
        parse_env_var!(config, port, "RELAY_PORT", u16);
        parse_env_var!(opt config, auth_token, "RELAY_AUTH_TOKEN");
        parse_env_var!(opt config, log_file, "RELAY_LOG_FILE");
        parse_env_var!(config, separate_window, "RELAY_SEPARATE_WINDOW", bool);
        parse_env_var!(config, probe_timeout_ms, "RELAY_PROBE_TIMEOUT_MS", u64);
        parse_env_var!(config, poll_interval_ms, "RELAY_POLL_INTERVAL_MS", u64);
        parse_env_var!(config, start_timeout_ms, "RELAY_START_TIMEOUT_MS", u64);
        parse_env_var!(config, extension_wait_timeout_ms, "RELAY_EXTENSION_WAIT_TIMEOUT_MS", u64);
        parse_env_var!(config, log_level, "RELAY_LOG_LEVEL");

        Ok(config)
    }

    /// Load configuration from a TOML file, kept for parity even though
    /// env vars are the primary surface.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("failed to read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::configuration(format!("failed to parse config: {e}")))?;
        Ok(config)
    }
}
