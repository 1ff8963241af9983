//! I/O utilities for redir
//!
//! # Buffer Pool
//!
//! `BufferPool` hands out fixed-size copy buffers and takes them back when
//! the `PooledBuffer` guard is dropped, so a leg never leaks its buffer.
//!
//! # Forwarding
//!
//! `relay` runs the two directions of one connection as separate tasks tied
//! together by a single-fire `TeardownGuard`.

mod buffer_pool;
mod copy;

pub use buffer_pool::{BufferPool, BufferPoolStats, BufferPoolStatsSnapshot, PooledBuffer};
pub use copy::{
    forward_leg, relay, CloseCause, CloseReason, CopyResult, Direction, LegEnd, LegReport,
    LegTimeouts, RelayOutcome, TeardownGuard, TeardownTrigger,
};
