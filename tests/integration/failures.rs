//! Failure-path tests: every one must close the client and leave the
//! proxy serving.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{host_address, start_kernel_proxy, start_proxy, test_config, wait_until, MockLookup};
use redir::config::ForwardConfig;

/// Read until EOF or error, returning the bytes seen.
async fn drain(client: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let _ = client.read_to_end(&mut received).await;
    received
}

/// A port on loopback with nothing listening
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_unresolvable_closes_without_dial() {
    // Upstream exists but must never be dialed
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = start_proxy(MockLookup::unresolvable(), test_config()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), drain(&mut client))
        .await
        .expect("client not closed");
    assert!(received.is_empty());

    let stats = proxy.stats.clone();
    assert!(wait_until(|| stats.resolve_failures() == 1, Duration::from_secs(2)).await);
    assert_eq!(proxy.stats.connect_failures(), 0);
    assert_eq!(proxy.stats.completed(), 0);

    let dialed = tokio::time::timeout(Duration::from_millis(200), upstream.accept()).await;
    assert!(dialed.is_err(), "upstream was dialed after a failed resolution");
}

#[tokio::test]
async fn test_refused_upstream_closes_client() {
    let upstream = closed_port().await;
    let proxy = start_proxy(MockLookup::redirect_to(upstream), test_config()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let _ = client.write_all(b"hello").await;
    let received = tokio::time::timeout(Duration::from_secs(2), drain(&mut client))
        .await
        .expect("client not closed");
    assert!(received.is_empty());

    let stats = proxy.stats.clone();
    assert!(wait_until(|| stats.connect_failures() == 1, Duration::from_secs(2)).await);
    let snapshot = proxy.stats.snapshot();
    assert_eq!(snapshot.resolve_failures, 0);
    assert_eq!(snapshot.total_bytes(), 0);
}

#[tokio::test]
async fn test_unresponsive_upstream_times_out() {
    // A listener that never accepts, with its queue filled so further SYNs
    // go unanswered.
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    socket
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
        .unwrap();
    socket.listen(0).unwrap();
    let upstream = socket.local_addr().unwrap().as_socket().unwrap();

    let mut fillers = Vec::new();
    for _ in 0..8 {
        if let Ok(Ok(stream)) =
            tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(upstream)).await
        {
            fillers.push(stream);
        }
    }

    let config = ForwardConfig {
        connect_timeout_ms: 300,
        ..test_config()
    };
    let proxy = start_proxy(MockLookup::redirect_to(upstream), config).await;

    let started = Instant::now();
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(3), drain(&mut client))
        .await
        .expect("client not closed after connect timeout");

    assert!(received.is_empty());
    assert!(started.elapsed() < Duration::from_millis(300 + 1_000));

    let stats = proxy.stats.clone();
    assert!(wait_until(|| stats.connect_failures() == 1, Duration::from_secs(2)).await);
    assert_eq!(proxy.stats.snapshot().total_bytes(), 0);
    drop(fillers);
}

#[tokio::test]
async fn test_idle_connection_is_torn_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let held = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Silent until the proxy closes us
        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf).await;
    });

    let config = ForwardConfig {
        idle_timeout_ms: 200,
        ..test_config()
    };
    let proxy = start_proxy(MockLookup::redirect_to(upstream), config).await;

    let started = Instant::now();
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(3), drain(&mut client))
        .await
        .expect("idle connection not closed");

    assert!(received.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));

    tokio::time::timeout(Duration::from_secs(2), held)
        .await
        .expect("upstream side not closed")
        .unwrap();

    let stats = proxy.stats.clone();
    assert!(wait_until(|| stats.completed() == 1, Duration::from_secs(2)).await);
    assert_eq!(proxy.pool.outstanding(), 0);
    assert_eq!(proxy.pool.available(), 2);
}

#[tokio::test]
async fn test_half_close_tears_down_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received).await;
        received
    });

    let proxy = start_proxy(MockLookup::redirect_to(upstream), test_config()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"bye").await.unwrap();
    client.shutdown().await.unwrap();

    // The upstream never answers or closes; the client's FIN alone must end
    // the whole connection.
    let received = tokio::time::timeout(Duration::from_secs(2), drain(&mut client))
        .await
        .expect("upstream direction outlived the client direction");
    assert!(received.is_empty());

    let upstream_saw = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("upstream not closed")
        .unwrap();
    assert_eq!(upstream_saw, b"bye");
}

#[tokio::test]
async fn test_direct_connection_to_host_address_is_not_looped() {
    let Some(host) = host_address() else {
        return;
    };
    let proxy = start_kernel_proxy(test_config()).await;

    let direct = SocketAddrV4::new(host, proxy.addr.port());
    let mut client = TcpStream::connect(direct).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), drain(&mut client))
        .await
        .expect("client not closed");
    assert!(received.is_empty());

    let stats = proxy.stats.clone();
    assert!(wait_until(|| stats.resolve_failures() == 1, Duration::from_secs(2)).await);

    // A looped dial would show up as a second accepted connection
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(proxy.stats.total_accepted(), 1);
    assert_eq!(proxy.stats.connect_failures(), 0);
}

#[tokio::test]
async fn test_failures_do_not_stop_the_service() {
    let upstream = closed_port().await;
    let proxy = start_proxy(MockLookup::redirect_to(upstream), test_config()).await;

    for _ in 0..5 {
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), drain(&mut client))
            .await
            .expect("client not closed");
    }

    let stats = proxy.stats.clone();
    assert!(wait_until(|| stats.connect_failures() == 5, Duration::from_secs(2)).await);
    assert_eq!(proxy.stats.total_accepted(), 5);
    assert_eq!(proxy.stats.active(), 0);
}
