//! Connection handling module
//!
//! This module provides:
//! - The accept loop, spawning one task per connection
//! - The per-connection forwarder (resolve, dial, relay)
//! - The connection lifecycle state machine
//! - Statistics collection

mod forwarder;
mod server;
mod state;
mod stats;

pub use forwarder::{dial, ConnectionOutcome, Forwarder};
pub use server::{run_accept_loop, spawn_connection};
pub use state::ConnState;
pub use stats::{ConnectionStats, StatsSnapshot};
