//! Kernel socket options used for interception
//!
//! - `IP_TRANSPARENT` lets the listener accept TPROXY-diverted connections
//!   whose destination is not a local address.
//! - `SO_ORIGINAL_DST` returns the pre-NAT destination of a connection that
//!   iptables `REDIRECT` / `DNAT` rewrote.
//!
//! Decoding the kernel's `sockaddr_in` bytes is kept separate from the
//! syscall so it can be tested with literal byte arrays.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use crate::error::{ResolveError, StartupError};

/// Linux kernel constant: `IP_TRANSPARENT` socket option (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Size of `struct sockaddr_in`
pub const SOCKADDR_IN_LEN: usize = 16;

/// Bytes needed to decode family, port and address
const SOCKADDR_IN_MIN_LEN: usize = 8;

/// Decode a kernel `sockaddr_in` into an IPv4 socket address.
///
/// Layout: family (host byte order) at 0..2, port (network order) at 2..4,
/// address (network order) at 4..8. The trailing padding is ignored.
///
/// # Errors
///
/// Returns `ResolveError::Decode` if the buffer is shorter than 8 bytes or
/// the family is not `AF_INET`.
pub fn decode_sockaddr_in(buf: &[u8]) -> Result<SocketAddrV4, ResolveError> {
    if buf.len() < SOCKADDR_IN_MIN_LEN {
        return Err(ResolveError::Decode(format!(
            "need at least {SOCKADDR_IN_MIN_LEN} bytes, got {}",
            buf.len()
        )));
    }

    let family = u16::from_ne_bytes([buf[0], buf[1]]);
    if libc::c_int::from(family) != libc::AF_INET {
        return Err(ResolveError::Decode(format!(
            "address family {family} is not AF_INET"
        )));
    }

    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);

    Ok(SocketAddrV4::new(ip, port))
}

/// Query `SO_ORIGINAL_DST` on an accepted connection.
///
/// # Errors
///
/// Returns `ResolveError::Redirect` if the connection carries no NAT
/// record (`ENOENT` / `ENOPROTOOPT`) or the call fails otherwise, and
/// `ResolveError::Decode` if the kernel returns a malformed address.
pub fn original_dst(fd: RawFd) -> Result<SocketAddrV4, ResolveError> {
    let mut buf = [0u8; SOCKADDR_IN_LEN];
    let mut len = SOCKADDR_IN_LEN as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            buf.as_mut_ptr().cast::<libc::c_void>(),
            &raw mut len,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ENOENT | libc::ENOPROTOOPT) => {
                ResolveError::Redirect("no NAT record for this connection".into())
            }
            _ => ResolveError::Redirect(format!("getsockopt SO_ORIGINAL_DST failed: {err}")),
        });
    }

    let len = (len as usize).min(SOCKADDR_IN_LEN);
    trace!("SO_ORIGINAL_DST returned {} bytes", len);
    decode_sockaddr_in(&buf[..len])
}

/// Set `IP_TRANSPARENT` on a socket.
///
/// # Errors
///
/// Returns `StartupError::PermissionDenied` without `CAP_NET_ADMIN`, and
/// `StartupError::SocketOption` for any other failure.
pub fn set_ip_transparent(socket: &Socket) -> Result<(), StartupError> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            IP_TRANSPARENT,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(StartupError::PermissionDenied);
        }
        return Err(StartupError::socket_option("IP_TRANSPARENT", err.to_string()));
    }

    Ok(())
}

/// Check whether `IP_TRANSPARENT` can be set, i.e. the process holds
/// `CAP_NET_ADMIN`.
#[must_use]
pub fn has_net_admin_capability() -> bool {
    match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
        Ok(socket) => !matches!(
            set_ip_transparent(&socket),
            Err(StartupError::PermissionDenied)
        ),
        // Other errors don't indicate a missing capability
        Err(_) => true,
    }
}

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
