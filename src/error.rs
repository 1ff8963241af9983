//! Error types for redir
//!
//! Errors are split by where they can happen. Everything that happens after
//! `accept()` (`ResolveError`, `ConnectError`, `ForwardError`) is local to one
//! connection and never reaches the accept loop. `StartupError` and
//! `ConfigError` happen before the first accept and end the process.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required argument
    #[error("Missing argument: {0}")]
    MissingArgument(String),

    /// Unparseable argument value
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    /// Unknown command-line flag
    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    /// Validation error (out-of-range values)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Listener setup errors. All of them are fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Failed to create socket
    #[error("Failed to create listening socket: {0}")]
    SocketCreation(String),

    /// Failed to set socket option (IP_TRANSPARENT, SO_REUSEADDR, ...)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind or listen
    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Permission denied (CAP_NET_ADMIN required)
    #[error("Permission denied: IP_TRANSPARENT requires CAP_NET_ADMIN capability")]
    PermissionDenied,
}

impl StartupError {
    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }
}

/// Failure to recover the original destination of an intercepted socket
#[derive(Debug, Error)]
pub enum ResolveError {
    /// `SO_ORIGINAL_DST` lookup failed
    #[error("SO_ORIGINAL_DST lookup failed: {0}")]
    Redirect(String),

    /// Local address lookup failed or was not IPv4
    #[error("local address lookup failed: {0}")]
    Transparent(String),

    /// Kernel address structure could not be decoded
    #[error("malformed sockaddr: {0}")]
    Decode(String),

    /// Both strategies failed
    #[error("no original destination (redirect: {redirect}; transparent: {transparent})")]
    Exhausted {
        redirect: Box<ResolveError>,
        transparent: Box<ResolveError>,
    },

    /// The resolved destination is this service's own listener
    #[error("destination {0} is the listener itself")]
    SelfLoop(SocketAddr),
}

/// Upstream dial errors
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Connection failed (refused, unreachable, ...)
    #[error("Failed to connect to {addr}: {reason}")]
    Failed { addr: SocketAddr, reason: String },

    /// Connection timeout
    #[error("Connection to {addr} timed out after {}ms", .timeout.as_millis())]
    Timeout { addr: SocketAddr, timeout: Duration },
}

impl ConnectError {
    /// Create a connection failed error
    pub fn failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Failed {
            addr,
            reason: reason.into(),
        }
    }
}

/// Reasons a forwarding leg stops with an error
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No bytes arrived within the idle timeout
    #[error("idle timeout after {}s", .0.as_secs_f64())]
    IdleTimeout(Duration),

    /// A write did not complete within the write timeout
    #[error("write timeout after {}s", .0.as_secs_f64())]
    WriteTimeout(Duration),

    /// Peer accepted fewer bytes than were read
    #[error("short write")]
    ShortWrite,

    /// Read failed
    #[error("read failed: {0}")]
    Read(io::Error),

    /// Write failed
    #[error("write failed: {0}")]
    Write(io::Error),
}

impl ForwardError {
    /// Classify a write error, mapping `WriteZero` to `ShortWrite`
    pub fn from_write(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::WriteZero {
            Self::ShortWrite
        } else {
            Self::Write(err)
        }
    }
}
