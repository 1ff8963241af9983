//! Configuration types for redir
//!
//! All timeouts are stored in milliseconds so tests can run with short
//! windows; the command line takes whole seconds.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default connect timeout for upstream dials (5s)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default idle read timeout per leg (30s)
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Default write timeout per chunk (5s)
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

/// Default copy buffer size (32 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of idle buffers kept by the pool
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Largest accepted copy buffer (16 MiB)
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Largest accepted idle buffer count; the pool reserves every slot up front
pub const MAX_POOL_CAPACITY: usize = 1 << 20;

/// Default TCP accept backlog
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Listening socket
    pub listen: ListenConfig,

    /// Per-connection forwarding behaviour
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;
        self.forward.validate()?;
        self.log.validate()?;

        if self.forward.strategy == ResolveStrategy::Tproxy && !self.listen.transparent {
            return Err(ConfigError::ValidationError(
                "strategy 'tproxy' requires a transparent listener".into(),
            ));
        }

        Ok(())
    }
}

/// Listening socket configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenConfig {
    /// TCP port, bound on the IPv4 wildcard address
    pub port: u16,

    /// Set `IP_TRANSPARENT` on the listener
    #[serde(default = "default_true")]
    pub transparent: bool,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl ListenConfig {
    /// Create a listen config for the given port with defaults
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            transparent: true,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// The address the listener binds: `0.0.0.0:<port>`
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port))
    }

    /// Validate listen configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "listen port must be greater than 0".into(),
            ));
        }

        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "backlog must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self::new(7893)
    }
}

/// How the original destination is recovered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveStrategy {
    /// `SO_ORIGINAL_DST` first, then the local address
    #[default]
    Auto,
    /// `SO_ORIGINAL_DST` only (iptables REDIRECT / DNAT)
    Redirect,
    /// Local address only (iptables TPROXY)
    Tproxy,
}

impl ResolveStrategy {
    /// Whether the `SO_ORIGINAL_DST` lookup is attempted
    #[must_use]
    pub const fn tries_redirect(self) -> bool {
        matches!(self, Self::Auto | Self::Redirect)
    }

    /// Whether the local-address lookup is attempted
    #[must_use]
    pub const fn tries_transparent(self) -> bool {
        matches!(self, Self::Auto | Self::Tproxy)
    }
}

impl FromStr for ResolveStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "redirect" | "nat" => Ok(Self::Redirect),
            "tproxy" | "transparent" => Ok(Self::Tproxy),
            _ => Err(ConfigError::invalid("strategy", s)),
        }
    }
}

impl fmt::Display for ResolveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Redirect => f.write_str("redirect"),
            Self::Tproxy => f.write_str("tproxy"),
        }
    }
}

/// Per-connection forwarding configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForwardConfig {
    /// Upstream connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Idle read timeout per leg in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Write timeout per chunk in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Copy buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle buffers retained by the pool
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Destination resolution strategy
    #[serde(default)]
    pub strategy: ResolveStrategy,
}

impl ForwardConfig {
    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get idle timeout as Duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Get write timeout as Duration
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate forward configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("connect_timeout", self.connect_timeout_ms),
            ("idle_timeout", self.idle_timeout_ms),
            ("write_timeout", self.write_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.pool_capacity == 0 || self.pool_capacity > MAX_POOL_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "pool_capacity must be between 1 and {MAX_POOL_CAPACITY} (got {})",
                self.pool_capacity
            )));
        }

        if !(1024..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "buffer_size must be between 1024 and {MAX_BUFFER_SIZE} bytes (got {})",
                self.buffer_size
            )));
        }

        Ok(())
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            strategy: ResolveStrategy::Auto,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::invalid("log level", &self.level));
        }

        if !matches!(self.format.as_str(), "text" | "json") {
            return Err(ConfigError::invalid("log format", &self.format));
        }

        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

const fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

const fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

const fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

const fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
