//! Forwarding legs and the connection teardown guard
//!
//! A connection is relayed by two independent tasks, one per direction. Each
//! task ("leg") borrows one buffer from the [`BufferPool`] and loops
//! read-with-idle-timeout / write-with-write-timeout until something ends it.
//!
//! The first leg to end fires the shared [`TeardownGuard`]. The guard is
//! single-fire: the first `close` records why the connection is going away,
//! every later `close` is a no-op. The sibling leg waits on the guard next to
//! its own I/O, so it stops at its pending read or write and drops its stream
//! halves. Once both legs have returned, all four halves are gone and both
//! sockets are closed. A direction never outlives the other.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn, Instrument};

use super::buffer_pool::BufferPool;
use crate::config::ForwardConfig;
use crate::error::ForwardError;

/// Result of a bidirectional copy operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Direction of a forwarding leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client socket to upstream socket
    ClientToUpstream,
    /// Upstream socket to client socket
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("client->upstream"),
            Self::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

/// Why a leg stopped
#[derive(Debug)]
pub enum LegEnd {
    /// Source reached end of stream
    Eof,
    /// Read or write failed, or a deadline expired
    Failed(ForwardError),
    /// The sibling leg fired the teardown guard
    Teardown,
}

/// What the first leg to finish recorded in the teardown guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Orderly end of stream
    Eof,
    /// Idle timeout expired
    IdleTimeout,
    /// Write timeout expired
    WriteTimeout,
    /// Peer accepted fewer bytes than were read
    ShortWrite,
    /// Read failed with the given error kind
    ReadFailed(io::ErrorKind),
    /// Write failed with the given error kind
    WriteFailed(io::ErrorKind),
    /// Leg task panicked or was cancelled
    Aborted,
}

impl From<&ForwardError> for CloseCause {
    fn from(err: &ForwardError) -> Self {
        match err {
            ForwardError::IdleTimeout(_) => Self::IdleTimeout,
            ForwardError::WriteTimeout(_) => Self::WriteTimeout,
            ForwardError::ShortWrite => Self::ShortWrite,
            ForwardError::Read(e) => Self::ReadFailed(e.kind()),
            ForwardError::Write(e) => Self::WriteFailed(e.kind()),
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("eof"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::WriteTimeout => f.write_str("write timeout"),
            Self::ShortWrite => f.write_str("short write"),
            Self::ReadFailed(kind) => write!(f, "read error ({kind})"),
            Self::WriteFailed(kind) => write!(f, "write error ({kind})"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// First-close record: which leg ended first and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Leg that fired the guard
    pub direction: Direction,
    /// Why it ended
    pub cause: CloseCause,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.direction, self.cause)
    }
}

/// Single-fire teardown signal shared by the two legs of one connection.
///
/// Cloning is cheap and every clone refers to the same signal. `close` may be
/// called any number of times from any task; only the first call records a
/// reason and wakes the waiters.
#[derive(Debug, Clone)]
pub struct TeardownGuard {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl TeardownGuard {
    /// Create an open guard
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the guard. Returns `true` only for the call that fired it.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(reason);
                true
            }
        })
    }

    /// Whether the guard has fired
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The reason recorded by the first `close`
    #[must_use]
    pub fn reason(&self) -> Option<CloseReason> {
        self.tx.borrow().clone()
    }

    /// Wait until the guard fires. Returns immediately if it already has.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if rx.borrow_and_update().is_some() {
                return;
            }
            // The sender lives as long as `self`, so this never errors.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A handle that fires the guard with `CloseCause::Aborted` when dropped,
    /// unless the guard already fired.
    #[must_use]
    pub fn trigger(&self, direction: Direction) -> TeardownTrigger {
        TeardownTrigger {
            guard: self.clone(),
            direction,
        }
    }
}

impl Default for TeardownGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires the teardown guard when a leg exits by any path, panics included.
#[derive(Debug)]
pub struct TeardownTrigger {
    guard: TeardownGuard,
    direction: Direction,
}

impl Drop for TeardownTrigger {
    fn drop(&mut self) {
        self.guard.close(CloseReason {
            direction: self.direction,
            cause: CloseCause::Aborted,
        });
    }
}

/// Per-leg deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegTimeouts {
    /// Maximum wait for each read
    pub idle: Duration,
    /// Maximum wait for each write of one read's worth of bytes
    pub write: Duration,
}

impl From<&ForwardConfig> for LegTimeouts {
    fn from(config: &ForwardConfig) -> Self {
        Self {
            idle: config.idle_timeout(),
            write: config.write_timeout(),
        }
    }
}

/// Outcome of one leg
#[derive(Debug)]
pub struct LegReport {
    /// Leg direction
    pub direction: Direction,
    /// Bytes fully written to the destination
    pub bytes: u64,
    /// Why the leg stopped
    pub end: LegEnd,
}

/// Run one forwarding leg until EOF, error, timeout or teardown.
///
/// The leg owns `src` and `dst`; both are dropped when it returns. The pooled
/// buffer is released on every exit path.
pub async fn forward_leg<R, W>(
    mut src: R,
    mut dst: W,
    direction: Direction,
    pool: Arc<BufferPool>,
    timeouts: LegTimeouts,
    guard: TeardownGuard,
) -> LegReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _trigger = guard.trigger(direction);
    let mut buf = pool.acquire();
    let mut bytes: u64 = 0;

    let end = loop {
        let n = tokio::select! {
            biased;
            () = guard.closed() => break LegEnd::Teardown,
            read = timeout(timeouts.idle, src.read(&mut buf[..])) => match read {
                Err(_) => break LegEnd::Failed(ForwardError::IdleTimeout(timeouts.idle)),
                Ok(Ok(0)) => break LegEnd::Eof,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => break LegEnd::Failed(ForwardError::Read(e)),
            },
        };

        tokio::select! {
            biased;
            () = guard.closed() => break LegEnd::Teardown,
            write = timeout(timeouts.write, dst.write_all(&buf[..n])) => match write {
                Err(_) => break LegEnd::Failed(ForwardError::WriteTimeout(timeouts.write)),
                Ok(Err(e)) => break LegEnd::Failed(ForwardError::from_write(e)),
                Ok(Ok(())) => bytes += n as u64,
            },
        }

        trace!("{}: forwarded {} bytes", direction, n);
    };

    let cause = match &end {
        LegEnd::Eof => Some(CloseCause::Eof),
        LegEnd::Failed(e) => Some(CloseCause::from(e)),
        LegEnd::Teardown => None,
    };
    if let Some(cause) = cause {
        if guard.close(CloseReason { direction, cause }) {
            debug!("{} ended first ({:?}), tearing down", direction, end);
        }
    }

    LegReport {
        direction,
        bytes,
        end,
    }
}

/// Outcome of relaying one connection
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes moved per direction
    pub copy: CopyResult,
    /// The first leg to end and why
    pub reason: Option<CloseReason>,
}

/// Relay between a client and an upstream until either direction ends.
///
/// Each direction runs on its own spawned task. When this returns, both legs
/// have finished and every half passed in has been dropped.
pub async fn relay<CR, CW, UR, UW>(
    client: (CR, CW),
    upstream: (UR, UW),
    pool: &Arc<BufferPool>,
    timeouts: LegTimeouts,
) -> RelayOutcome
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    UR: AsyncRead + Unpin + Send + 'static,
    UW: AsyncWrite + Unpin + Send + 'static,
{
    let (client_rd, client_wr) = client;
    let (upstream_rd, upstream_wr) = upstream;
    let guard = TeardownGuard::new();

    let outbound = tokio::spawn(forward_leg(
        client_rd,
        upstream_wr,
        Direction::ClientToUpstream,
        Arc::clone(pool),
        timeouts,
        guard.clone(),
    )
    .in_current_span());
    let inbound = tokio::spawn(forward_leg(
        upstream_rd,
        client_wr,
        Direction::UpstreamToClient,
        Arc::clone(pool),
        timeouts,
        guard.clone(),
    )
    .in_current_span());

    let (outbound, inbound) = tokio::join!(outbound, inbound);

    let copy = CopyResult {
        client_to_upstream: leg_bytes(outbound, Direction::ClientToUpstream),
        upstream_to_client: leg_bytes(inbound, Direction::UpstreamToClient),
    };

    RelayOutcome {
        copy,
        reason: guard.reason(),
    }
}

fn leg_bytes(joined: Result<LegReport, tokio::task::JoinError>, direction: Direction) -> u64 {
    match joined {
        Ok(report) => report.bytes,
        Err(e) => {
            warn!("{} leg task failed: {}", direction, e);
            0
        }
    }
}
