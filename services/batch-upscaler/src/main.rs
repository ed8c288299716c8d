//! Batch media upscaler
//!
//! Single-binary Rust service that:
//! 1. Loads API keys from the environment and the key file into a credential pool
//! 2. Scans the input folder for videos and images
//! 3. Runs admitted files through the remote enhancement service under a concurrency cap
//! 4. Exposes an operator API for start/pause/resume/stop, keys and jobs

mod admin;
mod config;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credential_pool::{KeyStore, Pool};
use enhance_client::HttpConnector;
use job_queue::{JobEvent, Scheduler};
use media_tools::Ffmpeg;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;

/// How long in-flight API requests may take to drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state for health and metrics handlers
#[derive(Clone)]
struct AppState {
    scheduler: Scheduler,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router: health and metrics plus the operator API.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let admin = build_admin_router(AdminState::new(state.scheduler.clone()));
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(admin)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting batch-upscaler");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.admin.listen_addr,
        base_url = %config.remote.base_url,
        workers = config.scheduler.workers,
        env_keys = config.api_keys.len(),
        "configuration loaded"
    );

    let pool = build_pool(&config).await?;
    let refresh_handle =
        credential_pool::spawn_refresh_task(Arc::clone(&pool), config.refresh_interval());

    let media = Ffmpeg::new(&config.media.ffmpeg_path, &config.media.ffprobe_path);
    let scheduler = Scheduler::new(pool, Arc::new(media), config.scheduler_config());
    let events_handle = tokio::spawn(log_events(scheduler.clone()));

    match scheduler.scan_input().await {
        Ok(added) => info!(files = added, "input folder scanned"),
        Err(e) => warn!(error = %e, "initial input scan skipped"),
    }

    if config.scheduler.autostart
        && let Err(e) = scheduler.start().await
    {
        warn!(error = %e, "autostart failed, waiting for operator");
    }

    let app_state = AppState {
        scheduler: scheduler.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.admin.max_connections);

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    // Wait for the OS signal
    shutdown_signal().await;

    // Stop admitting work and wait for job tasks to wind down. Remote
    // requests already submitted keep running on the service side.
    scheduler.shutdown().await;
    refresh_handle.abort();
    events_handle.abort();

    // Signal the server to begin draining
    let _ = shutdown_tx.send(());

    // The drain timer starts at signal receipt
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Build the credential pool from ENHANCE_API_KEYS and the key file.
///
/// Startup keys are trusted without a validation request; balances are
/// fetched once before the scheduler sees the pool.
async fn build_pool(config: &Config) -> Result<Arc<Pool>> {
    let connector = HttpConnector::new(&config.remote.base_url, config.request_timeout())
        .context("failed to build HTTP client")?;
    let store = KeyStore::load(config.credentials.keys_file.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load key file {}",
                config.credentials.keys_file.display()
            )
        })?;
    let stored = store.keys().await;
    let pool = Arc::new(Pool::with_store(Arc::new(connector), Arc::new(store)));

    let env_keys = config.api_keys.iter().map(|k| k.expose().clone());
    for key in env_keys.chain(stored) {
        if pool.restore(&key).await.is_none() {
            debug!("skipping duplicate startup key");
        }
    }

    pool.refresh_all_credits().await;
    let stats = pool.stats().await;
    if stats.total == 0 {
        warn!("no API keys configured, add one through POST /credentials");
    }
    info!(keys = stats.total, "credential pool ready");
    Ok(pool)
}

/// Log processing-state changes from the scheduler's event stream.
async fn log_events(scheduler: Scheduler) {
    let mut events = scheduler.events();
    loop {
        match events.recv().await {
            Ok(JobEvent::State { state }) => info!(%state, "processing state changed"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Health endpoint: liveness, processing state, uptime and pool size.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let snapshot = state.scheduler.snapshot();
    let pool = state.scheduler.pool().stats().await;

    let body = serde_json::json!({
        "status": "healthy",
        "state": snapshot.state,
        "workers": snapshot.workers,
        "active_jobs": snapshot.active,
        "credentials": pool.total,
        "uptime_seconds": uptime,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint - returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.scheduler.pool().stats().await;
    metrics::set_credentials_available(pool.eligible);

    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
