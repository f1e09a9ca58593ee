use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dispatch_core::archive::JobArchive;
use dispatch_store::StateStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatch_api::config::{LogFormat, ServerConfig};
use dispatch_api::router::build_app_router;
use dispatch_api::state::AppState;
use dispatch_api::{background, ws};

/// Grace period for each background task after cancellation.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid server configuration")?;

    // --- Tracing ---
    let (json_layer, text_layer) = match config.log_format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer())),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "dispatch_api=debug,dispatch_events=debug,dispatch_queue=debug,tower_http=debug"
                        .into()
                }),
        )
        .with(json_layer)
        .with(text_layer)
        .init();

    tracing::info!(
        host = %config.host,
        port = %config.port,
        node_id = %config.node_id,
        "Loaded server configuration"
    );

    // --- Shared state store ---
    let store: Arc<dyn StateStore> = match config.redis_url.as_deref() {
        Some(url) => {
            let store = dispatch_store::RedisStore::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("Redis state store connected");
            Arc::new(store)
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory state store (single process only)");
            Arc::new(dispatch_store::MemoryStore::new())
        }
    };

    // --- Database ---
    let archive: Arc<dyn JobArchive> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = dispatch_db::create_pool(url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connection pool created");

            dispatch_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            tracing::info!("Database health check passed");

            dispatch_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied");

            Arc::new(dispatch_db::PgJobArchive::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, finished jobs are kept in memory only");
            Arc::new(dispatch_db::MemoryJobArchive::new())
        }
    };

    // --- App state ---
    let state = AppState::build(config.clone(), store, archive);

    // --- Background tasks ---
    let cancel = CancellationToken::new();
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    if let Some(relay) = state.hub.relay() {
        tasks.push((
            "relay",
            tokio::spawn(Arc::clone(relay).run_inbound(Arc::clone(&state.hub), cancel.clone())),
        ));
    }
    tasks.push((
        "heartbeat",
        tokio::spawn(ws::start_heartbeat(
            Arc::clone(&state.hub),
            config.dispatch.clone(),
            cancel.clone(),
        )),
    ));
    tasks.push((
        "offers",
        tokio::spawn(background::offers::run(
            Arc::clone(&state.queue),
            Arc::clone(&state.hub),
            config.dispatch.offer_loop_interval,
            cancel.clone(),
        )),
    ));
    tasks.push((
        "reaper",
        tokio::spawn(background::reaper::run(
            Arc::clone(&state.queue),
            Arc::clone(&state.hub),
            Arc::clone(&state.metrics),
            config.dispatch.reaper_interval,
            cancel.clone(),
        )),
    ));
    tasks.push((
        "archiver",
        tokio::spawn(background::archiver::run(
            Arc::clone(&state.queue),
            Arc::clone(&state.archive),
            Arc::clone(&state.metrics),
            config.dispatch.cleanup_interval,
            cancel.clone(),
        )),
    ));
    tracing::info!(count = tasks.len(), "Background tasks started");

    // --- Router ---
    let app = build_app_router(state.clone(), &config);

    // --- Start server ---
    let host: std::net::IpAddr = config
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address '{}'", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    // Upgraded sockets are not drained by the server; close them on signal.
    let shutdown_hub = Arc::clone(&state.hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let closed = shutdown_hub.shutdown().await;
            tracing::info!(closed, "Dispatch connections closed");
        })
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    cancel.cancel();
    for (name, handle) in tasks {
        if tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await.is_err() {
            tracing::warn!(task = name, "Background task did not stop in time");
        }
    }
    tracing::info!("Background tasks stopped");

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
