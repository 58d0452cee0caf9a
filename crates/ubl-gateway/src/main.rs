//! ubl-gateway — HTTP + SSE + JSON-RPC surface for the UBL service.
//!
//! Serves the REST API and `/mcp` on the main listener and Prometheus
//! metrics on a separate localhost-only listener. Configuration comes from
//! the environment (see `ubl_core::config`) with CLI overrides; args win.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use ubl_core::store::{IndexStore, MemoryStateStore, SqliteStateStore, StateStore};
use ubl_core::{ServiceConfig, UblRuntime};
use ubl_gateway::state::AppState;

/// UBL gateway server.
#[derive(Parser, Debug)]
#[command(name = "ubl-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Listen address for the API.
    #[arg(long, default_value = "127.0.0.1:8787")]
    addr: SocketAddr,

    /// SQLite database file (index store + coordinator state). Omit for
    /// fully in-memory operation.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Port for the Prometheus metrics listener (localhost only).
    #[arg(long, default_value = "9100")]
    metrics_port: u16,

    /// Disable the metrics listener.
    #[arg(long)]
    no_metrics: bool,

    /// Log filter (overrides LOG_LEVEL).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::from_env();

    let filter = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    let filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (state_store, index): (Arc<dyn StateStore>, Arc<IndexStore>) = match &args.db {
        Some(path) => {
            let index = Arc::new(IndexStore::open(path).context("failed to open index store")?);
            let state_store = Arc::new(SqliteStateStore::from_connection(index.connection()));
            info!(db = %path.display(), "persistent stores opened");
            (state_store, index)
        }
        None => {
            info!("running with in-memory stores");
            (
                Arc::new(MemoryStateStore::new()),
                Arc::new(IndexStore::in_memory().context("failed to initialize index store")?),
            )
        }
    };

    let runtime = Arc::new(UblRuntime::new(config, state_store, index));
    let state = AppState::new(Arc::clone(&runtime));

    // Metrics get their own localhost-only listener.
    if !args.no_metrics {
        let metrics_addr: SocketAddr = ([127, 0, 0, 1], args.metrics_port).into();
        let metrics_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics_state, metrics_addr).await {
                error!("metrics server error: {e}");
            }
        });
    } else {
        info!("metrics listener disabled");
    }

    let app = ubl_gateway::router(state);
    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    info!(addr = %args.addr, "ubl-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("gateway shutdown complete");
    Ok(())
}

/// Resolves when SIGTERM or Ctrl-C arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("received Ctrl-C");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Serves `/metrics` in Prometheus text format.
async fn run_metrics_server(state: AppState, addr: SocketAddr) -> Result<()> {
    async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
        match state.metrics.encode_text(state.runtime.counters()) {
            Ok(body) => (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
                .into_response(),
            Err(e) => {
                error!("failed to encode metrics: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}")).into_response()
            }
        }
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind metrics listener")?;
    info!(addr = %addr, "metrics listener up");
    axum::serve(listener, app).await.context("metrics server error")?;
    Ok(())
}
