//! Configuration module for redir
//!
//! There is no configuration file. The effective configuration is built from
//! defaults, then command-line arguments, then `REDIR_*` environment
//! overrides, and validated once before the listener is bound.
//!
//! # Example
//!
//! ```
//! use redir::config::parse_args;
//!
//! let config = parse_args(["8080", "--idle-timeout", "60"]).unwrap();
//! assert_eq!(config.listen.port, 8080);
//! assert_eq!(config.forward.idle_timeout(), std::time::Duration::from_secs(60));
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, parse_args, ENV_IDLE_TIMEOUT, ENV_LOG_LEVEL, ENV_PORT, ENV_STRATEGY,
};
pub use types::{
    Config, ForwardConfig, ListenConfig, LogConfig, ResolveStrategy, DEFAULT_BACKLOG,
    DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_IDLE_TIMEOUT_MS,
    DEFAULT_POOL_CAPACITY, DEFAULT_WRITE_TIMEOUT_MS, MAX_BUFFER_SIZE, MAX_POOL_CAPACITY,
};
