//! Original destination recovery
//!
//! Two lookups exist. Redirect-style asks the NAT table through
//! `SO_ORIGINAL_DST`; transparent-style reads the accepted socket's local
//! address, which on an `IP_TRANSPARENT` listener is the destination the
//! client dialed. The [`ResolveStrategy`] picks which of them run and in
//! what order.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use super::socket::original_dst;
use crate::config::{ListenConfig, ResolveStrategy};
use crate::error::ResolveError;

/// Which lookup produced the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveMethod {
    /// `SO_ORIGINAL_DST`
    Redirect,
    /// Local address of the accepted socket
    Transparent,
}

impl fmt::Display for ResolveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redirect => f.write_str("redirect"),
            Self::Transparent => f.write_str("tproxy"),
        }
    }
}

/// A recovered original destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Where the client meant to connect
    pub addr: SocketAddrV4,
    /// How it was found
    pub method: ResolveMethod,
}

/// Source of original-destination lookups.
///
/// [`KernelLookup`] is the production implementation. Tests substitute
/// lookups that succeed or fail on demand, since a plain loopback connection
/// would otherwise resolve to the listener itself.
pub trait OriginalDstLookup: Send + Sync + fmt::Debug {
    /// Redirect-style lookup
    ///
    /// # Errors
    ///
    /// Returns `ResolveError` if the connection has no NAT record.
    fn redirect_dst(&self, stream: &TcpStream) -> Result<SocketAddrV4, ResolveError>;

    /// Transparent-style lookup
    ///
    /// # Errors
    ///
    /// Returns `ResolveError` if the local address is unavailable or not IPv4.
    fn transparent_dst(&self, stream: &TcpStream) -> Result<SocketAddrV4, ResolveError>;
}

/// Lookups backed by the kernel
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelLookup;

impl OriginalDstLookup for KernelLookup {
    fn redirect_dst(&self, stream: &TcpStream) -> Result<SocketAddrV4, ResolveError> {
        original_dst(stream.as_raw_fd())
    }

    fn transparent_dst(&self, stream: &TcpStream) -> Result<SocketAddrV4, ResolveError> {
        let local = stream
            .local_addr()
            .map_err(|e| ResolveError::Transparent(e.to_string()))?;
        ipv4_only(local)
    }
}

/// Narrow a local address to IPv4, unwrapping IPv4-mapped IPv6.
///
/// # Errors
///
/// Returns `ResolveError::Transparent` for a native IPv6 address.
pub fn ipv4_only(addr: SocketAddr) -> Result<SocketAddrV4, ResolveError> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port()))
            .ok_or_else(|| ResolveError::Transparent(format!("{addr} is not IPv4"))),
    }
}

/// Resolves the original destination of accepted connections.
#[derive(Debug, Clone)]
pub struct DestinationResolver {
    lookup: Arc<dyn OriginalDstLookup>,
    strategy: ResolveStrategy,
    listen_port: u16,
    transparent_listener: bool,
}

impl DestinationResolver {
    /// Create a resolver over the given lookup.
    ///
    /// `listen_port` is this service's own port; a destination pointing back
    /// at it is refused. The listener is assumed transparent until
    /// [`with_transparent_listener`](Self::with_transparent_listener) says
    /// otherwise.
    #[must_use]
    pub fn new(
        lookup: Arc<dyn OriginalDstLookup>,
        strategy: ResolveStrategy,
        listen_port: u16,
    ) -> Self {
        Self {
            lookup,
            strategy,
            listen_port,
            transparent_listener: true,
        }
    }

    /// Create a kernel-backed resolver for the given listener.
    #[must_use]
    pub fn kernel(strategy: ResolveStrategy, listen: &ListenConfig) -> Self {
        Self::new(Arc::new(KernelLookup), strategy, listen.port)
            .with_transparent_listener(listen.transparent)
    }

    /// Record whether the listener has `IP_TRANSPARENT`.
    ///
    /// Without it the local address of an accepted socket is always one of
    /// this host's own addresses, so the transparent lookup is skipped.
    #[must_use]
    pub const fn with_transparent_listener(mut self, transparent: bool) -> Self {
        self.transparent_listener = transparent;
        self
    }

    /// Recover the original destination of `stream`.
    ///
    /// Under `Auto`, redirect-style runs first and transparent-style only if
    /// it fails. A lookup that yields this service's own listening endpoint
    /// counts as a failure of that lookup.
    ///
    /// # Errors
    ///
    /// Returns the single lookup's error for `Redirect` / `Tproxy`, and
    /// `ResolveError::Exhausted` naming both failures under `Auto`.
    pub fn resolve(&self, stream: &TcpStream) -> Result<Resolved, ResolveError> {
        let local_ip = stream
            .local_addr()
            .ok()
            .and_then(|addr| ipv4_only(addr).ok())
            .map(|addr| *addr.ip());

        let redirect = if self.strategy.tries_redirect() {
            match self.checked(self.lookup.redirect_dst(stream), local_ip) {
                Ok(addr) => {
                    return Ok(Resolved {
                        addr,
                        method: ResolveMethod::Redirect,
                    })
                }
                Err(e) => {
                    debug!("redirect lookup failed: {}", e);
                    Some(e)
                }
            }
        } else {
            None
        };

        if !(self.strategy.tries_transparent() && self.transparent_listener) {
            return Err(redirect.unwrap_or_else(|| {
                ResolveError::Transparent("listener is not transparent".into())
            }));
        }

        match self.checked(self.lookup.transparent_dst(stream), local_ip) {
            Ok(addr) => Ok(Resolved {
                addr,
                method: ResolveMethod::Transparent,
            }),
            Err(transparent) => match redirect {
                Some(redirect) => Err(ResolveError::Exhausted {
                    redirect: Box::new(redirect),
                    transparent: Box::new(transparent),
                }),
                None => Err(transparent),
            },
        }
    }

    fn checked(
        &self,
        result: Result<SocketAddrV4, ResolveError>,
        local_ip: Option<Ipv4Addr>,
    ) -> Result<SocketAddrV4, ResolveError> {
        let addr = result?;
        if self.is_self(addr, local_ip) {
            return Err(ResolveError::SelfLoop(SocketAddr::V4(addr)));
        }
        Ok(addr)
    }

    /// The listener binds the wildcard, so our port on loopback, on the
    /// unspecified address or on the address the client reached us through
    /// all lead back here.
    fn is_self(&self, addr: SocketAddrV4, local_ip: Option<Ipv4Addr>) -> bool {
        let ip = *addr.ip();
        addr.port() == self.listen_port
            && (ip.is_loopback() || ip.is_unspecified() || Some(ip) == local_ip)
    }
}
