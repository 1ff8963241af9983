//! End-to-end forwarding tests

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{start_proxy, test_config, wait_until, MockLookup};

const REQUEST: &[u8] = b"GET / \r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Serve one request: read until the blank line, answer, close.
async fn http_upstream() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 256];
        while !request.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client went away mid-request");
            request.extend_from_slice(&buf[..n]);
        }
        stream.write_all(RESPONSE).await.unwrap();
        request
    });

    (addr, task)
}

/// Echo every connection until the peer closes.
async fn echo_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_http_round_trip_via_redirect() {
    let (upstream, server) = http_upstream().await;
    let proxy = start_proxy(MockLookup::redirect_to(upstream), test_config()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(REQUEST).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .expect("response not delivered")
        .unwrap();

    assert_eq!(response, RESPONSE);
    assert_eq!(server.await.unwrap(), REQUEST);

    let stats = proxy.stats.clone();
    assert!(wait_until(|| stats.completed() == 1, Duration::from_secs(2)).await);

    let snapshot = proxy.stats.snapshot();
    assert_eq!(snapshot.total_accepted, 1);
    assert_eq!(snapshot.active, 0);
    assert_eq!(snapshot.bytes_client_to_upstream, REQUEST.len() as u64);
    assert_eq!(snapshot.bytes_upstream_to_client, RESPONSE.len() as u64);
    assert_eq!(proxy.pool.outstanding(), 0);
}

#[tokio::test]
async fn test_transparent_fallback_forwards() {
    let (upstream, server) = http_upstream().await;
    let proxy = start_proxy(MockLookup::transparent_to(upstream), test_config()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(REQUEST).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .expect("response not delivered")
        .unwrap();

    assert_eq!(response, RESPONSE);
    assert_eq!(server.await.unwrap(), REQUEST);
    assert_eq!(proxy.stats.resolve_failures(), 0);
}

#[tokio::test]
async fn test_large_transfer_preserves_order() {
    let upstream = echo_upstream().await;
    let proxy = start_proxy(MockLookup::redirect_to(upstream), test_config()).await;

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i * 7 % 256) as u8).collect();

    let client = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut rd, mut wr) = client.into_split();

    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&to_send).await.unwrap();
        // Keep the write half open; a shutdown would tear the connection down
        wr
    });

    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), rd.read_exact(&mut echoed))
        .await
        .expect("echo not delivered")
        .unwrap();

    assert!(echoed == payload, "echoed bytes differ from the bytes sent");

    let wr = writer.await.unwrap();
    drop(wr);
    drop(rd);

    let stats = proxy.stats.clone();
    assert!(wait_until(|| stats.completed() == 1, Duration::from_secs(2)).await);

    let snapshot = proxy.stats.snapshot();
    assert_eq!(snapshot.bytes_client_to_upstream, payload.len() as u64);
    assert_eq!(snapshot.bytes_upstream_to_client, payload.len() as u64);
    assert_eq!(proxy.pool.outstanding(), 0);
}

#[tokio::test]
async fn test_concurrent_connections_share_pool() {
    const CONNECTIONS: usize = 32;

    let upstream = echo_upstream().await;
    let proxy = start_proxy(MockLookup::redirect_to(upstream), test_config()).await;

    let clients: Vec<_> = (0..CONNECTIONS)
        .map(|i| {
            let addr = proxy.addr;
            tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let message = vec![i as u8; 8192];
                client.write_all(&message).await.unwrap();

                let mut echoed = vec![0u8; message.len()];
                client.read_exact(&mut echoed).await.unwrap();
                assert_eq!(echoed, message);
            })
        })
        .collect();

    for client in clients {
        tokio::time::timeout(Duration::from_secs(10), client)
            .await
            .expect("client stalled")
            .unwrap();
    }

    let stats = proxy.stats.clone();
    assert!(
        wait_until(
            || stats.completed() == CONNECTIONS as u64,
            Duration::from_secs(5)
        )
        .await
    );

    let pool = &proxy.pool;
    assert_eq!(pool.outstanding(), 0);
    assert!(pool.high_water() <= CONNECTIONS * 2);
    let allocations = usize::try_from(pool.stats().allocations()).unwrap();
    assert!(allocations <= pool.high_water());
}
