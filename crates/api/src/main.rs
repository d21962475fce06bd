use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use evidence_core::run_store::RunStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evidence_api::background::run_retention;
use evidence_api::config::ServerConfig;
use evidence_api::router::build_app_router;
use evidence_api::setup;
use evidence_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evidence_api=debug,evidence_sandbox=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };
    tracing::info!(
        host = %config.host,
        port = %config.port,
        execution_backend = ?config.execution_backend,
        timeout_ms = config.limits.timeout_ms,
        "Loaded server configuration"
    );

    // --- Run store ---
    let (pool, runs): (Option<evidence_db::DbPool>, Arc<dyn RunStore>) =
        match &config.database_url {
            Some(database_url) => {
                let pool = evidence_db::create_pool(database_url)
                    .await
                    .expect("Failed to connect to database");
                tracing::info!("Database connection pool created");

                evidence_db::health_check(&pool)
                    .await
                    .expect("Database health check failed");
                tracing::info!("Database health check passed");

                evidence_db::run_migrations(&pool)
                    .await
                    .expect("Failed to run database migrations");
                tracing::info!("Database migrations applied");

                let runs: Arc<dyn RunStore> =
                    Arc::new(evidence_db::PgRunStore::new(pool.clone()));
                (Some(pool), runs)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, run records are kept in memory");
                (None, setup::memory_run_store())
            }
        };

    // --- Scripts, sandboxes, tracker ---
    let scripts = setup::script_store(&config).await;
    if config.secrets.is_none() {
        tracing::warn!("No secret bundles configured, getSecret resolves to null");
    }
    let tracker = setup::run_tracker(&config, &scripts, Arc::clone(&runs));

    // --- Run retention ---
    let retention_cancel = tokio_util::sync::CancellationToken::new();
    let retention_handle = tokio::spawn(run_retention::run(
        runs,
        Duration::from_secs(config.run_retention_secs),
        run_retention::CLEANUP_INTERVAL,
        retention_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        scripts,
        tracker: tracker.clone(),
        pool,
    };

    // --- Router ---
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    let in_flight = tracker.active_runs().await;
    tracing::info!(in_flight, "Waiting for in-flight runs");
    tracker
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;

    retention_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), retention_handle).await;
    tracing::info!("Run retention job stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
