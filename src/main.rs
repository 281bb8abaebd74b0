//! Veda Monitor - Data Quality Incident Service
//!
//! Tracks the column layout of relational datasets over time and raises
//! incidents when a dataset's schema drifts or its data goes stale.
//!
//! Captures arrive either pushed over HTTP or pulled from registered
//! PostgreSQL sources. Every check compares the two latest captures of a
//! dataset, tests the newest one for freshness, and lets the incident
//! ledger open, keep or resolve the matching incidents.

mod config;
mod connection;
mod db;
mod error;
mod models;
mod monitor;
mod routes;
mod state;

use crate::config::{LogFormat, Settings};
use crate::db::{PgCaptureStore, PgIncidentStore};
use crate::routes::create_router;
use crate::state::{AppState, SharedState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_tracing(settings.log_format);

    info!("🚀 Starting Veda Monitor...");
    info!("📋 Configuration loaded successfully");

    let state = Arc::new(init_state(&settings).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = settings.monitoring.check_interval().map(|period| {
        info!("⏱️  Scheduled checks every {:?}", period);
        tokio::spawn(run_scheduled_checks(state.clone(), period, shutdown_rx))
    });

    let app = create_router(state, &settings);
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Datasets ───");
    info!("   GET  /api/datasets                    - List captured datasets");
    info!("   POST /api/datasets/{{key}}/captures     - Push a capture");
    info!("   GET  /api/datasets/{{key}}/captures     - Capture history");
    info!("   GET  /api/datasets/{{key}}/diff         - Diff of the latest two captures");
    info!("   POST /api/datasets/{{key}}/check        - Check drift and freshness");
    info!("   POST /api/datasets/{{key}}/refresh      - Capture from source, then check");
    info!("   POST /api/checks/run                  - Check many datasets");
    info!("");
    info!("   ─── Incidents ───");
    info!("   GET  /api/incidents                   - List incidents");
    info!("   GET  /api/incidents/{{id}}              - Get an incident");
    info!("");
    info!("   ─── Sources ───");
    info!("   POST /api/connections                 - Register a PostgreSQL source");
    info!("   GET  /api/connections                 - List sources");
    info!("   DELETE /api/connections/{{id}}          - Remove a source");
    info!("   POST /api/connections/{{id}}/discover   - Capture and check every table");
    info!("   GET  /api/connections/{{id}}/datasets   - Captured datasets of a source");
    info!("   POST /api/connections/{{id}}/checks     - Check a source's datasets");
    info!("   GET  /api/connections/{{id}}/incidents  - Incidents of a source");
    info!("");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!("Scheduled check task ended abnormally: {}", e);
        }
    }

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,veda_monitor=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init(),
    }
}

/// Pick PostgreSQL stores when a database is configured, memory otherwise
async fn init_state(settings: &Settings) -> anyhow::Result<AppState> {
    let Some(database) = &settings.database else {
        warn!("⚠️  No DATABASE_URL set, using in-memory stores (nothing is persisted)");
        return Ok(AppState::in_memory(&settings.monitoring));
    };

    let pool = db::connect(&database.url, database.max_pool_size)
        .await
        .map_err(|e| {
            error!("❌ FATAL: Failed to initialize database pool: {}", e);
            e
        })?;
    db::bootstrap(&pool).await?;
    info!("✅ Database pool created successfully");

    Ok(AppState::new(
        Arc::new(PgCaptureStore::new(pool.clone())),
        Arc::new(PgIncidentStore::new(pool)),
        &settings.monitoring,
        "postgres",
    ))
}

/// Periodically check every captured dataset until shutdown
async fn run_scheduled_checks(
    state: SharedState,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.orchestrator.check_all().await {
                    Ok(summary) => info!(
                        "Scheduled run: {} datasets, {} failed, {} opened, {} resolved",
                        summary.datasets_checked,
                        summary.failures.len(),
                        summary.opened,
                        summary.resolved
                    ),
                    Err(e) => error!("Scheduled run failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
