//! Per-connection forwarding
//!
//! A [`Forwarder`] takes one accepted client socket through its whole life:
//! resolve the original destination, dial it, relay both directions until
//! the first leg ends, then record the outcome. Every failure is terminal
//! for the connection and for nothing else.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{info, trace, warn, Span};

use super::state::ConnState;
use super::stats::ConnectionStats;
use crate::config::ForwardConfig;
use crate::error::{ConnectError, ResolveError};
use crate::intercept::{DestinationResolver, ResolveMethod};
use crate::io::{relay, BufferPool, CloseReason, CopyResult, LegTimeouts};

/// How a connection ended
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// No original destination; nothing was dialed
    ResolveFailed(ResolveError),
    /// The destination could not be reached; nothing was forwarded
    ConnectFailed {
        /// Resolved destination
        dst: SocketAddrV4,
        /// Dial error
        error: ConnectError,
    },
    /// Both legs ran and the connection closed
    Forwarded {
        /// Resolved destination
        dst: SocketAddrV4,
        /// How the destination was found
        method: ResolveMethod,
        /// Bytes per direction
        copy: CopyResult,
        /// First leg to end and why
        reason: Option<CloseReason>,
        /// Time from accept to close
        duration: Duration,
    },
}

impl ConnectionOutcome {
    /// Bytes forwarded in both directions
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        match self {
            Self::Forwarded { copy, .. } => copy.total(),
            Self::ResolveFailed(_) | Self::ConnectFailed { .. } => 0,
        }
    }
}

/// Drives intercepted connections to their original destinations.
#[derive(Debug)]
pub struct Forwarder {
    resolver: DestinationResolver,
    pool: Arc<BufferPool>,
    config: ForwardConfig,
    stats: Arc<ConnectionStats>,
}

impl Forwarder {
    /// Create a forwarder.
    #[must_use]
    pub fn new(
        resolver: DestinationResolver,
        pool: Arc<BufferPool>,
        config: ForwardConfig,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            resolver,
            pool,
            config,
            stats,
        }
    }

    /// Shared connection statistics
    #[must_use]
    pub const fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Shared buffer pool
    #[must_use]
    pub const fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Handle one accepted client until it is closed.
    ///
    /// The client socket is consumed; it is closed on every path before this
    /// returns. Records `dst` on the current span once resolved.
    pub async fn handle(&self, client: TcpStream, peer: SocketAddr) -> ConnectionOutcome {
        let started = Instant::now();
        let mut state = Lifecycle::new(peer);
        self.stats.record_accepted();

        state.advance(ConnState::Resolving);
        let resolved = match self.resolver.resolve(&client) {
            Ok(resolved) => resolved,
            Err(e) => {
                state.advance(ConnState::ResolvedFail);
                warn!("No original destination for {}: {}", peer, e);
                self.stats.record_resolve_failure();
                drop(client);
                state.advance(ConnState::Closed);
                return ConnectionOutcome::ResolveFailed(e);
            }
        };
        state.advance(ConnState::ResolvedOk);

        let dst = resolved.addr;
        Span::current().record("dst", tracing::field::display(dst));
        info!("Accepted connection from {} to {} ({})", peer, dst, resolved.method);

        state.advance(ConnState::Connecting);
        let upstream = match dial(dst, self.config.connect_timeout()).await {
            Ok(stream) => stream,
            Err(error) => {
                state.advance(ConnState::ConnectFail);
                warn!("Failed to reach {} for {}: {}", dst, peer, error);
                self.stats.record_connect_failure();
                drop(client);
                state.advance(ConnState::Closed);
                return ConnectionOutcome::ConnectFailed { dst, error };
            }
        };

        state.advance(ConnState::Forwarding);
        let outcome = relay(
            client.into_split(),
            upstream.into_split(),
            &self.pool,
            LegTimeouts::from(&self.config),
        )
        .await;
        state.advance(ConnState::Closed);

        let duration = started.elapsed();
        let reason_text = outcome
            .reason
            .as_ref()
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        info!(
            "Connection closed: {} -> {}, {} up / {} down bytes, {:.3}s, {}",
            peer,
            dst,
            outcome.copy.client_to_upstream,
            outcome.copy.upstream_to_client,
            duration.as_secs_f64(),
            reason_text
        );
        self.stats.record_completed(outcome.copy);

        ConnectionOutcome::Forwarded {
            dst,
            method: resolved.method,
            copy: outcome.copy,
            reason: outcome.reason,
            duration,
        }
    }
}

/// Dial `addr` over IPv4 TCP, giving up after `connect_timeout`.
///
/// # Errors
///
/// Returns `ConnectError::Timeout` if the deadline passes and
/// `ConnectError::Failed` for any other failure.
pub async fn dial(addr: SocketAddrV4, connect_timeout: Duration) -> Result<TcpStream, ConnectError> {
    let target = SocketAddr::V4(addr);
    let socket = TcpSocket::new_v4().map_err(|e| ConnectError::failed(target, e.to_string()))?;

    match timeout(connect_timeout, socket.connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ConnectError::failed(target, e.to_string())),
        Err(_) => Err(ConnectError::Timeout {
            addr: target,
            timeout: connect_timeout,
        }),
    }
}

/// Tracks the connection state and rejects illegal moves in debug builds.
struct Lifecycle {
    peer: SocketAddr,
    state: ConnState,
}

impl Lifecycle {
    const fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: ConnState::Accepted,
        }
    }

    fn advance(&mut self, next: ConnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        trace!("{}: {} -> {}", self.peer, self.state, next);
        self.state = next;
    }
}
