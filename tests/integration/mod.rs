//! Integration tests for redir
//!
//! Every test runs a real proxy on a loopback listener with real upstream
//! servers. Interception itself cannot happen on loopback without iptables,
//! so the original destination comes from a [`MockLookup`] that points at
//! the test's upstream (or fails, on demand).
//!
//! # Test Organization
//!
//! - `forwarding`: end-to-end byte relaying, fallback resolution, pool churn
//! - `failures`: resolution failure, refused and unresponsive upstreams,
//!   idle timeout, half-close teardown

pub mod failures;
pub mod forwarding;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use redir::config::{ForwardConfig, ListenConfig, ResolveStrategy};
use redir::connection::{run_accept_loop, ConnectionStats, Forwarder};
use redir::error::ResolveError;
use redir::intercept::{bind_addr, DestinationResolver, OriginalDstLookup};
use redir::io::BufferPool;

/// Lookup whose two strategies return fixed answers
#[derive(Debug, Clone, Default)]
pub struct MockLookup {
    pub redirect: Option<SocketAddrV4>,
    pub transparent: Option<SocketAddrV4>,
}

impl MockLookup {
    /// Redirect-style lookup succeeds
    pub fn redirect_to(addr: SocketAddr) -> Self {
        Self {
            redirect: Some(v4(addr)),
            transparent: None,
        }
    }

    /// Only the transparent-style lookup succeeds
    pub fn transparent_to(addr: SocketAddr) -> Self {
        Self {
            redirect: None,
            transparent: Some(v4(addr)),
        }
    }

    /// Both lookups fail
    pub fn unresolvable() -> Self {
        Self::default()
    }
}

impl OriginalDstLookup for MockLookup {
    fn redirect_dst(&self, _stream: &TcpStream) -> Result<SocketAddrV4, ResolveError> {
        self.redirect
            .ok_or_else(|| ResolveError::Redirect("no NAT record for this connection".into()))
    }

    fn transparent_dst(&self, _stream: &TcpStream) -> Result<SocketAddrV4, ResolveError> {
        self.transparent
            .ok_or_else(|| ResolveError::Transparent("not a transparent socket".into()))
    }
}

/// A running proxy; the accept loop is aborted on drop
pub struct Proxy {
    pub addr: SocketAddr,
    pub stats: Arc<ConnectionStats>,
    pub pool: Arc<BufferPool>,
    task: JoinHandle<()>,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forwarding settings with short timeouts
pub fn test_config() -> ForwardConfig {
    ForwardConfig {
        connect_timeout_ms: 1_000,
        idle_timeout_ms: 5_000,
        write_timeout_ms: 1_000,
        buffer_size: 4096,
        pool_capacity: 64,
        strategy: ResolveStrategy::Auto,
    }
}

/// Start a proxy on an ephemeral loopback port
pub async fn start_proxy(lookup: MockLookup, config: ForwardConfig) -> Proxy {
    let listener = bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), false, 128)
        .expect("bind proxy listener");
    let port = listener.local_addr().expect("proxy address").port();
    let resolver = DestinationResolver::new(Arc::new(lookup), config.strategy, port);
    serve(listener, resolver, config)
}

/// Start a kernel-backed, non-transparent proxy on the IPv4 wildcard
pub async fn start_kernel_proxy(config: ForwardConfig) -> Proxy {
    let listener = bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), false, 128)
        .expect("bind proxy listener");
    let listen = ListenConfig {
        port: listener.local_addr().expect("proxy address").port(),
        transparent: false,
        ..ListenConfig::default()
    };
    let resolver = DestinationResolver::kernel(config.strategy, &listen);
    serve(listener, resolver, config)
}

fn serve(listener: TcpListener, resolver: DestinationResolver, config: ForwardConfig) -> Proxy {
    let addr = listener.local_addr().expect("proxy address");

    let pool = Arc::new(BufferPool::new(config.pool_capacity, config.buffer_size));
    let stats = Arc::new(ConnectionStats::new());
    let forwarder = Arc::new(Forwarder::new(
        resolver,
        Arc::clone(&pool),
        config,
        Arc::clone(&stats),
    ));

    let task = tokio::spawn(run_accept_loop(listener, forwarder));

    Proxy {
        addr,
        stats,
        pool,
        task,
    }
}

/// An IPv4 address of this host other than loopback, if it has one
pub fn host_address() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_loopback() && !addr.ip().is_unspecified() => {
            Some(*addr.ip())
        }
        _ => None,
    }
}

/// Narrow a loopback address to IPv4
pub fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => panic!("expected an IPv4 address, got {addr}"),
    }
}

/// Poll `condition` until it holds or `limit` passes
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
