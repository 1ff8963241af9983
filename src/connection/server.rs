//! Accept loop

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::forwarder::{ConnectionOutcome, Forwarder};

/// Pause after an accept error that is not about a single connection
/// (e.g. `EMFILE`), so the loop does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Spawn a task that forwards one accepted connection.
///
/// The task runs inside an `info_span!("conn")` carrying the client address;
/// the destination is added once resolved.
pub fn spawn_connection(
    forwarder: Arc<Forwarder>,
    stream: TcpStream,
    peer: SocketAddr,
) -> JoinHandle<ConnectionOutcome> {
    let span = info_span!("conn", client = %peer, dst = tracing::field::Empty);
    tokio::spawn(async move { forwarder.handle(stream, peer).await }.instrument(span))
}

/// Run the accept loop forever.
///
/// Never awaits per-connection work. Accept errors are logged and the loop
/// continues; stop it by dropping the future (e.g. from `tokio::select!`).
pub async fn run_accept_loop(listener: TcpListener, forwarder: Arc<Forwarder>) {
    match listener.local_addr() {
        Ok(addr) => info!("Starting accept loop on {}", addr),
        Err(_) => info!("Starting accept loop"),
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                spawn_connection(Arc::clone(&forwarder), stream, peer);
            }
            Err(e) if is_per_connection(&e) => {
                debug!("Transient accept error: {}", e);
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

fn is_per_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
