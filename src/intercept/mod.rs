//! Connection interception
//!
//! Everything that touches the kernel's view of a redirected connection:
//! the listening socket, and recovery of where the client was really going.
//!
//! # Interception modes
//!
//! - **REDIRECT / DNAT**: iptables rewrites the destination to the local
//!   listener. The original is recovered with `SO_ORIGINAL_DST`.
//! - **TPROXY**: packets are diverted without rewriting. The listener needs
//!   `IP_TRANSPARENT` (and so `CAP_NET_ADMIN`), and the accepted socket's
//!   local address is the original destination.
//!
//! # IPv4 Only
//!
//! Only IPv4 destinations are recovered. An IPv4-mapped IPv6 local address
//! is accepted and unwrapped.
//!
//! # Example rules
//!
//! ```bash
//! # REDIRECT
//! iptables -t nat -A PREROUTING -p tcp --dport 80 -j REDIRECT --to-ports 7893
//!
//! # TPROXY
//! iptables -t mangle -A PREROUTING -p tcp --dport 80 \
//!     -j TPROXY --on-port 7893 --tproxy-mark 0x1/0x1
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! ```

mod listener;
mod resolver;
mod socket;

pub use listener::{bind_addr, bind_listener};
pub use resolver::{
    ipv4_only, DestinationResolver, KernelLookup, OriginalDstLookup, ResolveMethod, Resolved,
};
pub use socket::{
    decode_sockaddr_in, has_net_admin_capability, is_root, original_dst, set_ip_transparent,
    IP_TRANSPARENT, SOCKADDR_IN_LEN, SO_ORIGINAL_DST,
};
