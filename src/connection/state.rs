//! Per-connection lifecycle

use std::fmt;

/// Lifecycle of one intercepted connection.
///
/// ```text
/// Accepted -> Resolving -> ResolvedOk -> Connecting -> Forwarding -> Closed
///                 |                          |
///                 +-> ResolvedFail -> Closed +-> ConnectFail -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Socket accepted, nothing done yet
    Accepted,
    /// Looking up the original destination
    Resolving,
    /// Destination known
    ResolvedOk,
    /// No destination could be recovered
    ResolvedFail,
    /// Dialing the destination
    Connecting,
    /// Dial failed or timed out
    ConnectFail,
    /// Both legs running
    Forwarding,
    /// Terminal
    Closed,
}

impl ConnState {
    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Accepted, Self::Resolving)
                | (Self::Resolving, Self::ResolvedOk | Self::ResolvedFail)
                | (Self::ResolvedOk, Self::Connecting)
                | (Self::Connecting, Self::Forwarding | Self::ConnectFail)
                | (Self::ResolvedFail | Self::ConnectFail | Self::Forwarding, Self::Closed)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Resolving => "resolving",
            Self::ResolvedOk => "resolved",
            Self::ResolvedFail => "resolve-failed",
            Self::Connecting => "connecting",
            Self::ConnectFail => "connect-failed",
            Self::Forwarding => "forwarding",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
