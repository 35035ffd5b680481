//! TOML Configuration File Support
//!
//! Configuration for a relay process, read from
//! `~/.config/voice-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`], applied by the daemon)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! broker = "redis"
//! redis_addr = "cache.internal:6379"
//! channel = "VOICE"
//! tunnel_addr = "0.0.0.0:9001"
//! max_connections = 1024
//! subscription_capacity = 64
//! send_timeout_ms = 5000
//! handshake_timeout_ms = 10000
//!
//! [connect_retry]
//! max_attempts = 8
//! initial_backoff_ms = 100
//! max_backoff_ms = 10000
//! multiplier = 2.0
//! jitter = true
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `RELAY_BROKER` | `broker` |
//! | `REDIS_ADDR` | `redis_addr` |
//! | `RELAY_CHANNEL` | `channel` |
//! | `RELAY_TUNNEL_ADDR` | `tunnel_addr` |
//! | `RELAY_MAX_CONNECTIONS` | `max_connections` |
//! | `RELAY_SUBSCRIPTION_CAPACITY` | `subscription_capacity` |
//! | `RELAY_CONNECT_ATTEMPTS` | `connect_retry.max_attempts` |
//! | `RELAY_SEND_TIMEOUT_MS` | `send_timeout_ms` |
//! | `RELAY_HANDSHAKE_TIMEOUT_MS` | `handshake_timeout_ms` |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::redis::{DEFAULT_CHANNEL, DEFAULT_SUBSCRIPTION_CAPACITY};
use crate::broker::RetryPolicy;

/// Default Redis address (localhost)
pub const DEFAULT_REDIS_ADDR: &str = ":6379";

/// Default tunnel listen address
pub const DEFAULT_TUNNEL_ADDR: &str = "0.0.0.0:9001";

/// Default cap on concurrently open tunnels
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default deadline for one send to one session, in milliseconds
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

/// Default time a new connection gets to send its handshake, in milliseconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the highest-priority value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Which broker implementation a process uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Single-process channel broker
    Memory,
    /// Redis pub/sub
    #[default]
    Redis,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for BrokerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "inmem" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown broker '{other}' (expected 'memory' or 'redis')"
            ))),
        }
    }
}

/// Resolved relay configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Broker implementation
    pub broker: BrokerKind,
    /// Redis `host:port` (`:port` means localhost)
    pub redis_addr: String,
    /// Pub/sub channel shared by every relay process
    pub channel: String,
    /// Address the tunnel listener binds to
    pub tunnel_addr: String,
    /// Maximum concurrently open tunnels
    pub max_connections: usize,
    /// Buffer between the broker pump task and the dispatch task
    pub subscription_capacity: usize,
    /// Backoff for the startup connectivity probe
    pub connect_retry: RetryPolicy,
    /// Deadline for one send to one session; a miss counts as a failed delivery
    pub send_timeout_ms: u64,
    /// Deadline for a new connection's opening request
    pub handshake_timeout_ms: u64,

    /// Path of the file that was loaded, if any
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
    #[serde(skip)]
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::default(),
            redis_addr: DEFAULT_REDIS_ADDR.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            tunnel_addr: DEFAULT_TUNNEL_ADDR.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            connect_retry: RetryPolicy::default(),
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Per-session send deadline
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Handshake deadline for new connections
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "channel must not be empty".to_string(),
            ));
        }
        if self.redis_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "redis_addr must not be empty".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.subscription_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "subscription_capacity must be at least 1".to_string(),
            ));
        }
        if self.connect_retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "connect_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "send_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "handshake_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.connect_retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "connect_retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/voice-relay/relay.toml` or
/// `~/.config/voice-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("voice-relay").join("relay.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// A missing file is not an error; defaults are used.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result fails
/// validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Load configuration with a custom environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with<F>(path: Option<PathBuf>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            config = toml::from_str(&toml_content)?;
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
            config.config_file_path = Some(config_path);
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_overrides(&mut config, env)?;
    config.validate()?;

    Ok(config)
}

/// Apply environment variable overrides
///
/// Numeric values that fail to parse are logged and ignored.
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` for an unknown `RELAY_BROKER`.
pub fn apply_env_overrides<F>(config: &mut RelayConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(broker) = env("RELAY_BROKER") {
        config.broker = broker.parse()?;
        config.source = ConfigSource::Env;
    }
    if let Some(addr) = env("REDIS_ADDR") {
        config.redis_addr = addr;
        config.source = ConfigSource::Env;
    }
    if let Some(channel) = env("RELAY_CHANNEL") {
        config.channel = channel;
        config.source = ConfigSource::Env;
    }
    if let Some(addr) = env("RELAY_TUNNEL_ADDR") {
        config.tunnel_addr = addr;
        config.source = ConfigSource::Env;
    }
    if let Some(max) = parse_env(&env, "RELAY_MAX_CONNECTIONS") {
        config.max_connections = max;
        config.source = ConfigSource::Env;
    }
    if let Some(capacity) = parse_env(&env, "RELAY_SUBSCRIPTION_CAPACITY") {
        config.subscription_capacity = capacity;
        config.source = ConfigSource::Env;
    }
    if let Some(attempts) = parse_env(&env, "RELAY_CONNECT_ATTEMPTS") {
        config.connect_retry.max_attempts = attempts;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parse_env(&env, "RELAY_SEND_TIMEOUT_MS") {
        config.send_timeout_ms = ms;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parse_env(&env, "RELAY_HANDSHAKE_TIMEOUT_MS") {
        config.handshake_timeout_ms = ms;
        config.source = ConfigSource::Env;
    }
    Ok(())
}

fn parse_env<F, T>(env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}

/// Command-line overrides, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Broker implementation
    pub broker: Option<BrokerKind>,
    /// Redis address
    pub redis_addr: Option<String>,
    /// Pub/sub channel
    pub channel: Option<String>,
    /// Tunnel listen address
    pub tunnel_addr: Option<String>,
}

impl ConfigOverrides {
    /// Create empty overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the overrides that are set
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(broker) = self.broker {
            config.broker = broker;
            config.source = ConfigSource::Cli;
        }
        if let Some(ref addr) = self.redis_addr {
            config.redis_addr.clone_from(addr);
            config.source = ConfigSource::Cli;
        }
        if let Some(ref channel) = self.channel {
            config.channel.clone_from(channel);
            config.source = ConfigSource::Cli;
        }
        if let Some(ref addr) = self.tunnel_addr {
            config.tunnel_addr.clone_from(addr);
            config.source = ConfigSource::Cli;
        }
    }
}
