//! Connection statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::io::CopyResult;

/// Atomic connection statistics shared by every forwarder
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total connections accepted
    total_accepted: AtomicU64,
    /// Connections accepted but not yet closed
    active: AtomicU64,
    /// Connections that reached forwarding and closed
    completed: AtomicU64,
    /// Connections closed because no original destination was found
    resolve_failures: AtomicU64,
    /// Connections closed because the upstream dial failed
    connect_failures: AtomicU64,
    /// Total bytes client -> upstream
    bytes_client_to_upstream: AtomicU64,
    /// Total bytes upstream -> client
    bytes_upstream_to_client: AtomicU64,
}

impl ConnectionStats {
    /// Create new connection statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new accepted connection
    pub fn record_accepted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed after forwarding
    pub fn record_completed(&self, copy: CopyResult) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_client_to_upstream
            .fetch_add(copy.client_to_upstream, Ordering::Relaxed);
        self.bytes_upstream_to_client
            .fetch_add(copy.upstream_to_client, Ordering::Relaxed);
    }

    /// Record a connection closed because resolution failed
    pub fn record_resolve_failure(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed because the dial failed
    pub fn record_connect_failure(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total accepted connections
    #[must_use]
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    /// Get currently active connections
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Get completed connections
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Get resolution failures
    #[must_use]
    pub fn resolve_failures(&self) -> u64 {
        self.resolve_failures.load(Ordering::Relaxed)
    }

    /// Get connect failures
    #[must_use]
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_accepted: self.total_accepted(),
            active: self.active(),
            completed: self.completed(),
            resolve_failures: self.resolve_failures(),
            connect_failures: self.connect_failures(),
            bytes_client_to_upstream: self.bytes_client_to_upstream.load(Ordering::Relaxed),
            bytes_upstream_to_client: self.bytes_upstream_to_client.load(Ordering::Relaxed),
            timestamp_ms: u64::try_from(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis(),
            )
            .unwrap_or(u64::MAX),
        }
    }
}

/// Snapshot of connection statistics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total connections accepted
    pub total_accepted: u64,
    /// Currently active connections
    pub active: u64,
    /// Connections that were forwarded and closed
    pub completed: u64,
    /// Resolution failures
    pub resolve_failures: u64,
    /// Connect failures
    pub connect_failures: u64,
    /// Total bytes client -> upstream
    pub bytes_client_to_upstream: u64,
    /// Total bytes upstream -> client
    pub bytes_upstream_to_client: u64,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl StatsSnapshot {
    /// Get total bytes transferred (both directions)
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_client_to_upstream + self.bytes_upstream_to_client
    }

    /// Share of closed connections that were forwarded, as a percentage (0-100)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.resolve_failures + self.connect_failures;
        if total == 0 {
            100.0
        } else {
            (self.completed as f64 / total as f64) * 100.0
        }
    }
}
