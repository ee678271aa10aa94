//! Configuration management for sharetty.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sharetty/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{TerminalSize, MAX_DIMENSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::pty::{SessionOptions, DEFAULT_READ_BUFFER_SIZE};
use crate::session::registry::{DEFAULT_MAX_CLIENTS, DEFAULT_SEND_QUEUE_CAPACITY};

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 8000;

/// Largest accepted PTY read buffer.
const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Largest accepted replay buffer.
const MAX_REPLAY_BYTES: usize = 16 * 1024 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind must be an IP address, got {0}")]
    InvalidBindAddress(String),

    #[error("port must be greater than 0")]
    InvalidPort,

    #[error("max_message_size must be greater than 0")]
    InvalidMaxMessageSize,

    #[error("rows and cols must be between 1 and {max}, got {rows}x{cols}")]
    InvalidDimensions { rows: u16, cols: u16, max: u16 },

    #[error("read_buffer_size must be between 1 and 1048576, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("max_clients must be between 1 and 10000, got {0}")]
    InvalidMaxClients(usize),

    #[error("send_queue_capacity must be greater than 0")]
    InvalidSendQueueCapacity,

    #[error("replay_bytes must be at most 16777216, got {0}")]
    InvalidReplayBytes(usize),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for sharetty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Network server configuration.
    pub server: ServerConfig,

    /// Shared shell configuration.
    pub session: SessionConfig,

    /// Client limits and delivery settings.
    pub clients: ClientsConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

/// Network server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind. All interfaces by default so a proxy can reach us.
    pub bind: String,

    /// Port to listen on.
    pub port: u16,

    /// Largest inbound WebSocket message in bytes.
    pub max_message_size: usize,
}

/// Shared shell configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to run.
    pub shell: String,

    /// Initial terminal rows.
    pub rows: u16,

    /// Initial terminal columns.
    pub cols: u16,

    /// Working directory for the shell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Maximum bytes per output chunk.
    pub read_buffer_size: usize,

    /// Extra environment variables for the shell.
    pub env: BTreeMap<String, String>,
}

/// Client limits and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientsConfig {
    /// Maximum number of simultaneously attached clients.
    pub max_clients: usize,

    /// Messages buffered per client before output is dropped for it.
    pub send_queue_capacity: usize,

    /// Bytes of recent output replayed to new clients (0 = no replay).
    pub replay_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_message_size: 64 * 1024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let size = TerminalSize::default();
        Self {
            shell: default_shell(),
            rows: size.rows,
            cols: size.cols,
            cwd: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            env: BTreeMap::new(),
        }
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            replay_bytes: 0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sharetty")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHARETTY_BIND: Override the bind address
    /// - SHARETTY_PORT: Override the listen port
    /// - SHARETTY_SHELL: Override the shell
    /// - SHARETTY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(bind) = non_empty_env("SHARETTY_BIND") {
            tracing::info!("Overriding bind from environment: {}", bind);
            self.server.bind = bind;
        }

        if let Some(port) = non_empty_env("SHARETTY_PORT") {
            match port.parse() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid SHARETTY_PORT: {}", port),
            }
        }

        if let Some(shell) = non_empty_env("SHARETTY_SHELL") {
            tracing::info!("Overriding shell from environment: {}", shell);
            self.session.shell = shell;
        }

        if let Some(level) = non_empty_env("SHARETTY_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.log.level = level;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(self.server.bind.clone()));
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.server.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize);
        }

        let size = TerminalSize::new(self.session.rows, self.session.cols);
        if size.validate().is_err() {
            return Err(ConfigError::InvalidDimensions {
                rows: size.rows,
                cols: size.cols,
                max: MAX_DIMENSION,
            });
        }

        if self.session.read_buffer_size == 0 || self.session.read_buffer_size > MAX_READ_BUFFER_SIZE
        {
            return Err(ConfigError::InvalidReadBufferSize(
                self.session.read_buffer_size,
            ));
        }

        if self.clients.max_clients < 1 || self.clients.max_clients > 10_000 {
            return Err(ConfigError::InvalidMaxClients(self.clients.max_clients));
        }

        if self.clients.send_queue_capacity == 0 {
            return Err(ConfigError::InvalidSendQueueCapacity);
        }

        if self.clients.replay_bytes > MAX_REPLAY_BYTES {
            return Err(ConfigError::InvalidReplayBytes(self.clients.replay_bytes));
        }

        let shell_path = Path::new(&self.session.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Returns the address the server should listen on.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .server
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind.clone()))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Returns the options used to spawn the shared shell.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            shell: Some(self.session.shell.clone()),
            size: TerminalSize::new(self.session.rows, self.session.cols),
            env: self
                .session
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cwd: self.session.cwd.clone(),
            read_buffer_size: self.session.read_buffer_size,
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
