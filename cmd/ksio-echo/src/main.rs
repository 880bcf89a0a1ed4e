//! ksio Echo Server
//!
//! Every accepted connection copies its read pipe into its write pipe until
//! the peer closes, then closes gracefully.
//!
//! Usage:
//!     cargo build --release -p ksio-echo
//!     ./target/release/ksio-echo [port] [max_conns]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!
//! Logging is controlled by `KSIO_LOG` (default `info`), transport settings
//! by the `KSIO_*` variables read in `TransportConfig::from_env`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ksio::{KsioError, Socket, SocketFactory, SocketOptions, TransportConfig};
use tracing_subscriber::EnvFilter;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

#[derive(Default)]
struct Stats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
    bytes: AtomicU64,
}

impl Stats {
    fn print(&self, elapsed: f64) {
        let bytes = self.bytes.load(Ordering::Relaxed);
        let mib_per_sec = bytes as f64 / elapsed.max(1e-9) / (1024.0 * 1024.0);
        tracing::info!(
            accepted = self.accepted.load(Ordering::Relaxed),
            rejected = self.rejected.load(Ordering::Relaxed),
            active = self.active.load(Ordering::Relaxed),
            bytes,
            mib_per_sec,
            "stats"
        );
    }
}

async fn echo(sock: Socket, stats: Arc<Stats>) {
    match sock.reader().copy_to(sock.writer()).await {
        Ok(n) => {
            stats.bytes.fetch_add(n, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::debug!(peer = ?sock.remote_addr(), error = %e, "connection failed");
        }
    }
    sock.close();
    stats.active.fetch_sub(1, Ordering::Relaxed);
}

fn main() -> Result<(), KsioError> {
    let filter = EnvFilter::try_from_env("KSIO_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let max_conns: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1024);

    // SIGINT/SIGTERM for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    let config = TransportConfig::from_env();
    let factory = SocketFactory::new(config)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = Arc::new(factory.bind(addr, &SocketOptions::default())?);
    let stats = Arc::new(Stats::default());
    tracing::info!(%addr, max_conns, "ksio-echo listening");

    {
        let server = Arc::clone(&server);
        let stats = Arc::clone(&stats);
        let spawner = factory.clone();
        factory.spawn(async move {
            loop {
                let sock = match server.accept().await {
                    Ok(sock) => sock,
                    Err(e) if e.is_cancellation() => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if stats.active.load(Ordering::Relaxed) >= max_conns {
                    stats.rejected.fetch_add(1, Ordering::Relaxed);
                    sock.dispose();
                    continue;
                }
                stats.accepted.fetch_add(1, Ordering::Relaxed);
                stats.active.fetch_add(1, Ordering::Relaxed);
                spawner.spawn(echo(sock, Arc::clone(&stats)));
            }
            tracing::debug!("accept loop exited");
        });
    }

    let start = Instant::now();
    let mut last_stats = start;
    while !STOP.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
        if last_stats.elapsed() >= Duration::from_secs(5) {
            stats.print(start.elapsed().as_secs_f64());
            last_stats = Instant::now();
        }
    }

    tracing::info!("ksio-echo shutting down");
    stats.print(start.elapsed().as_secs_f64());
    server.close();
    factory.shutdown();
    Ok(())
}
