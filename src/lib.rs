//! redir: transparent TCP redirector
//!
//! Accepts TCP connections that the packet filter diverted to a local port
//! and relays each one, byte for byte, to the destination the client
//! originally dialed.
//!
//! # Features
//!
//! - **REDIRECT and TPROXY**: recovers the original destination with
//!   `SO_ORIGINAL_DST`, falling back to the local address of a transparent
//!   socket
//! - **Bounded forwarding**: connect, idle and write timeouts on every
//!   connection
//! - **Atomic teardown**: the first direction to end closes both sockets
//! - **Pooled buffers**: one reusable buffer per direction, returned on
//!   every exit path
//!
//! # Architecture
//!
//! ```text
//! Client → iptables REDIRECT/TPROXY → redir → Original destination
//!                                       ↓
//!                           resolve → dial → two legs
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use redir::config::parse_args;
//! use redir::connection::{run_accept_loop, ConnectionStats, Forwarder};
//! use redir::intercept::{bind_listener, DestinationResolver};
//! use redir::io::BufferPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = parse_args(["7893"])?;
//! let listener = bind_listener(&config.listen)?;
//!
//! let forwarder = Arc::new(Forwarder::new(
//!     DestinationResolver::kernel(config.forward.strategy, &config.listen),
//!     Arc::new(BufferPool::new(config.forward.pool_capacity, config.forward.buffer_size)),
//!     config.forward.clone(),
//!     Arc::new(ConnectionStats::new()),
//! ));
//!
//! run_accept_loop(listener, forwarder).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types, CLI and environment loading
//! - [`connection`]: Accept loop, forwarder and statistics
//! - [`error`]: Error types
//! - [`intercept`]: Listener setup and original destination recovery
//! - [`io`]: Buffer pool and forwarding legs

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod error;
pub mod intercept;
pub mod io;

// Re-export commonly used types at the crate root
pub use config::{Config, ForwardConfig, ListenConfig, ResolveStrategy};
pub use connection::{ConnectionStats, Forwarder};
pub use error::{ConfigError, ConnectError, ForwardError, ResolveError, StartupError};
pub use intercept::{DestinationResolver, OriginalDstLookup};
pub use io::BufferPool;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
