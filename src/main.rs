//! redir: transparent TCP redirector
//!
//! # Usage
//!
//! ```bash
//! # Listen on 7893 with defaults
//! sudo ./redir 7893
//!
//! # NAT REDIRECT only, no IP_TRANSPARENT needed
//! ./redir --strategy redirect --no-transparent 7893
//!
//! # Environment overrides
//! REDIR_LOG_LEVEL=debug sudo ./redir 7893
//! ```

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use redir::config::{apply_env_overrides, parse_args, LogConfig};
use redir::connection::{run_accept_loop, ConnectionStats, Forwarder};
use redir::intercept::{bind_listener, has_net_admin_capability, is_root, DestinationResolver};
use redir::io::BufferPool;

/// Command-line arguments handled before configuration parsing
struct Args {
    /// Everything else, passed to `parse_args`
    rest: Vec<String>,
    /// Print the effective configuration as JSON and exit
    print_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut rest = Vec::new();
        let mut print_config = false;

        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--print-config" => {
                    print_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("redir v{}", redir::VERSION);
                    std::process::exit(0);
                }
                _ => rest.push(arg),
            }
        }

        Self { rest, print_config }
    }
}

fn print_help() {
    println!(
        r"redir v{}

Transparent TCP redirector for iptables REDIRECT and TPROXY.

USAGE:
    redir [OPTIONS] <PORT>

OPTIONS:
    --idle-timeout <SECS>     Idle read timeout per direction [default: 30]
    --write-timeout <SECS>    Write timeout per chunk [default: 5]
    --connect-timeout <SECS>  Upstream connect timeout [default: 5]
    --strategy <STRATEGY>     auto, redirect or tproxy [default: auto]
    --no-transparent          Do not set IP_TRANSPARENT on the listener
    --backlog <N>             Accept backlog [default: 1024]
    --buffer-size <BYTES>     Copy buffer size [default: 32768]
    --pool-capacity <N>       Idle buffers kept for reuse [default: 1024]
    --log-level <LEVEL>       trace, debug, info, warn, error [default: info]
    --log-format <FORMAT>     text or json [default: text]
    --print-config            Print the effective configuration and exit
    -h, --help                Print help information
    -v, --version             Print version information

ENVIRONMENT:
    REDIR_PORT           Override the listening port
    REDIR_LOG_LEVEL      Override the log level
    REDIR_STRATEGY       Override the resolution strategy
    REDIR_IDLE_TIMEOUT   Override the idle timeout (seconds)
    RUST_LOG             Additional tracing filter directives

REQUIREMENTS:
    - CAP_NET_ADMIN (or root) unless --no-transparent is given

EXAMPLE:
    iptables -t nat -A PREROUTING -p tcp --dport 80 -j REDIRECT --to-ports 7893
    sudo redir 7893
",
        redir::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &LogConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    let mut config = parse_args(args.rest).context("Invalid arguments (see --help)")?;
    apply_env_overrides(&mut config).context("Invalid environment override")?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging(&config.log);

    info!("redir v{}", redir::VERSION);

    if config.listen.transparent && !is_root() && !has_net_admin_capability() {
        warn!("Not running as root and CAP_NET_ADMIN not detected");
        warn!("IP_TRANSPARENT requires CAP_NET_ADMIN; use --no-transparent for REDIRECT only");
    }

    let listener = bind_listener(&config.listen).context("Failed to create listener")?;

    let pool = Arc::new(BufferPool::new(
        config.forward.pool_capacity,
        config.forward.buffer_size,
    ));
    let stats = Arc::new(ConnectionStats::new());
    let resolver = DestinationResolver::kernel(config.forward.strategy, &config.listen);
    let forwarder = Arc::new(Forwarder::new(
        resolver,
        Arc::clone(&pool),
        config.forward.clone(),
        Arc::clone(&stats),
    ));

    info!(
        "redir ready on {} (strategy={}, idle={}s, write={}s, connect={}s)",
        config.listen.address(),
        config.forward.strategy,
        config.forward.idle_timeout().as_secs(),
        config.forward.write_timeout().as_secs(),
        config.forward.connect_timeout().as_secs()
    );
    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        () = run_accept_loop(listener, Arc::clone(&forwarder)) => {}
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    let snapshot = stats.snapshot();
    info!(
        "Final stats: {} accepted, {} forwarded, {} resolve failures, {} connect failures, {} still active ({:.1}% forwarded)",
        snapshot.total_accepted,
        snapshot.completed,
        snapshot.resolve_failures,
        snapshot.connect_failures,
        snapshot.active,
        snapshot.success_rate()
    );
    info!(
        "Transferred: {} bytes up, {} bytes down",
        snapshot.bytes_client_to_upstream, snapshot.bytes_upstream_to_client
    );

    let pool_stats = pool.stats().snapshot();
    info!(
        "Buffer pool: {} allocations, {} reuses ({:.1}% reused), high water {}",
        pool_stats.allocations,
        pool_stats.reuses,
        pool_stats.efficiency() * 100.0,
        pool.high_water()
    );

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
