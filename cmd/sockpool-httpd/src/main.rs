//! sockpool-httpd: HTTP/1.1 demo server on the pooled listener
//!
//! Every connection is served from pre-allocated buffers and worker
//! contexts; requests are handled on the bounded scheduler.
//!
//! Usage:
//!     ./target/release/sockpool-httpd [--port 8080] [--dir ./www]
//!
//! Defaults come from the `SOCKPOOL_*` environment variables; flags
//! override them. Log output is controlled by `RUST_LOG`.
//!
//! Benchmark:
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

mod handler;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sockpool_core::settings::ListenerSettings;
use sockpool_listener::SocketListener;
use sockpool_module::LogTrace;

use crate::handler::HttpHandler;

#[derive(Parser, Debug)]
#[command(name = "sockpool-httpd")]
#[command(about = "HTTP/1.1 server on the sockpool connection engine")]
struct Cli {
    /// Port to listen on (keeps the host of SOCKPOOL_ADDR)
    #[arg(short, long)]
    port: Option<u16>,

    /// Serve files from this directory instead of the hello response
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Maximum simultaneous connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Segment size in bytes; the largest request accepted
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Idle timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Seconds between stats lines (0 disables)
    #[arg(long, default_value_t = 5)]
    stats_secs: u64,
}

impl Cli {
    fn settings(&self) -> ListenerSettings {
        let mut settings = ListenerSettings::from_env();
        if let Some(port) = self.port {
            settings.local_addr = SocketAddr::new(settings.local_addr.ip(), port);
        }
        if let Some(n) = self.max_connections {
            settings.max_connections = n;
        }
        if let Some(n) = self.buffer_size {
            settings.buffer_size = n;
        }
        if let Some(ms) = self.timeout_ms {
            settings.connection_timeout = Duration::from_millis(ms);
        }
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();

    let handler = match &cli.dir {
        Some(dir) => HttpHandler::files(dir.clone()),
        None => HttpHandler::hello(),
    };
    let mode = cli
        .dir
        .as_ref()
        .map_or_else(|| "hello".to_string(), |d| format!("file({})", d.display()));

    let trace = Arc::new(LogTrace::new());
    let mut listener = SocketListener::with_trace(settings, Arc::new(handler), trace)
        .context("building listener")?;
    let addr = listener.start_listen().context("starting listener")?;
    tracing::info!(%addr, %mode, "sockpool-httpd: listening on http://{}/", addr);

    let start = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(cli.stats_secs.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for ctrl-c")?;
                break;
            }
            _ = ticker.tick(), if cli.stats_secs > 0 => {
                let stats = listener.stats();
                let elapsed = start.elapsed().as_secs_f64();
                let rps = stats.handled_total as f64 / elapsed.max(f64::EPSILON);
                tracing::info!(elapsed_s = elapsed as u64, rps = rps as u64, "{}", stats);
            }
        }
    }

    tracing::info!("shutting down");
    listener.shutdown().await;
    Ok(())
}
