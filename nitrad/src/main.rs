//! Nitra ComfyUI Backend Daemon
//!
//! Local HTTP backend for the Nitra frontend extension. Proxies the
//! Nitra website API, gates installs on subscription and device
//! registration, and runs installer scripts through a single-worker
//! task queue.

mod assets;
mod config;
mod device;
mod error;
mod gates;
mod queue;
mod routes;
mod scripts;
mod state;
mod status;
mod tracker;
mod userconfig;
mod versions;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use nitra_upstream::UpstreamClient;

use crate::config::Config;
use crate::device::DeviceStore;
use crate::queue::TaskQueue;
use crate::scripts::ScriptContext;
use crate::state::AppState;
use crate::status::StatusRegistry;
use crate::tracker::ProcessTracker;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "nitrad", version)]
#[command(about = "Nitra ComfyUI backend daemon")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8189")]
    listen: SocketAddr,

    /// Nitra website base URL (or use NITRA_WEBSITE_URL env var)
    #[arg(long)]
    base_url: Option<String>,

    /// ComfyUI installation root (auto-detected when omitted)
    #[arg(long)]
    comfy_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    info!("nitrad version {}", DAEMON_VERSION);

    let config = Arc::new(Config::resolve(cli.listen, cli.base_url, cli.comfy_root)?);
    nitra_common::statefile::ensure_secure_dir(&config.data_dir)
        .context("failed to prepare data directory")?;

    let upstream = Arc::new(UpstreamClient::new(&config.base_url)?);
    let tracker = Arc::new(ProcessTracker::new());
    let status = Arc::new(StatusRegistry::new());
    let device = Arc::new(DeviceStore::new(&config.data_dir));

    let ctx = ScriptContext {
        config: Arc::clone(&config),
        upstream: Arc::clone(&upstream),
        tracker: Arc::clone(&tracker),
    };
    let queue = TaskQueue::start(Arc::clone(&status), move |spec| {
        scripts::run_task(ctx.clone(), spec)
    });

    let state = AppState::new(config.clone(), upstream, queue, tracker, status, device);

    spawn_signal_handlers(state.clone());

    let router = routes::router(state);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("nitrad listening on {}", config.listen);

    axum::serve(listener, router.into_make_service())
        .await
        .context("server error")?;

    Ok(())
}

fn spawn_signal_handlers(state: AppState) {
    let ctrl_c_state = state.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down daemon");
            shutdown_daemon(ctrl_c_state).await;
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down daemon");
                shutdown_daemon(state).await;
            }
        });
    }
}

async fn shutdown_daemon(state: AppState) {
    if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
        return;
    }

    state.queue().reset();
    let cancelled = state.tracker().cancel_all().await;
    let snapshot = state.queue().snapshot();
    info!(
        cancelled_processes = cancelled,
        queued_tasks = snapshot.queue_size,
        "Graceful shutdown initiated"
    );

    // Give logs a moment to flush before exiting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::process::exit(0);
}
