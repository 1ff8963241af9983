//! Listening socket setup

use std::net::{SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::socket::set_ip_transparent;
use crate::config::ListenConfig;
use crate::error::StartupError;

/// Bind the listener described by `config` on `0.0.0.0:<port>`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns `StartupError::PermissionDenied` if `IP_TRANSPARENT` is requested
/// without `CAP_NET_ADMIN`, and another `StartupError` if socket creation,
/// binding or listening fails.
pub fn bind_listener(config: &ListenConfig) -> Result<TcpListener, StartupError> {
    let SocketAddr::V4(addr) = config.address() else {
        return Err(StartupError::SocketCreation(
            "listen address must be IPv4".into(),
        ));
    };
    bind_addr(addr, config.transparent, config.backlog)
}

/// Bind a listener on an explicit IPv4 address.
///
/// # Errors
///
/// See [`bind_listener`].
pub fn bind_addr(
    addr: SocketAddrV4,
    transparent: bool,
    backlog: u32,
) -> Result<TcpListener, StartupError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| StartupError::SocketCreation(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| StartupError::socket_option("SO_REUSEADDR", e.to_string()))?;

    if transparent {
        set_ip_transparent(&socket)?;
        debug!("IP_TRANSPARENT enabled on listener");
    }

    let sock_addr = SocketAddr::V4(addr);
    socket
        .bind(&sock_addr.into())
        .map_err(|e| StartupError::bind(sock_addr, e.to_string()))?;

    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket
        .listen(backlog)
        .map_err(|e| StartupError::bind(sock_addr, format!("listen: {e}")))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| StartupError::socket_option("O_NONBLOCK", e.to_string()))?;

    let listener = TcpListener::from_std(std::net::TcpListener::from(socket))
        .map_err(|e| StartupError::SocketCreation(e.to_string()))?;

    let local = listener.local_addr().unwrap_or(sock_addr);
    info!(
        "Listening on {} (transparent={}, backlog={})",
        local, transparent, backlog
    );

    Ok(listener)
}
