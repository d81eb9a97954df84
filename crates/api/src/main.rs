use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turbo_api::background;
use turbo_api::config::ServerConfig;
use turbo_api::router::build_app_router;
use turbo_api::state::AppState;
use turbo_pipeline::orchestrator::Orchestrator;
use turbo_pipeline::store::{PgScenarioStore, ScenarioStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "turbo_api=debug,turbo_pipeline=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().unwrap_or_else(|e| panic!("Invalid configuration: {e}"));
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let collaborators = config
        .stages
        .collaborators()
        .unwrap_or_else(|e| panic!("Invalid stage configuration: {e}"));

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = turbo_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    turbo_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    turbo_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Engine ---
    let store: Arc<dyn ScenarioStore> = Arc::new(PgScenarioStore::new(pool));
    let orchestrator = Arc::new(Orchestrator::new(
        config.engine.clone(),
        Arc::clone(&store),
        collaborators,
    ));

    background::restart_recovery::run(&orchestrator)
        .await
        .expect("Restart recovery failed");

    let dispatcher_cancel = CancellationToken::new();
    let dispatcher_handle = orchestrator.spawn_dispatcher(dispatcher_cancel.clone());

    let state = AppState {
        config: Arc::new(config.clone()),
        orchestrator: Arc::clone(&orchestrator),
        store,
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("HOST must be a valid IP address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    // Open progress streams keep their connections alive, so running jobs
    // are cancelled before axum waits for connections to drain.
    let draining = Arc::clone(&orchestrator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.shutdown().await;
        })
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);

    if !orchestrator.wait_idle(shutdown_timeout).await {
        tracing::warn!("Jobs still running after shutdown timeout");
    }

    dispatcher_cancel.cancel();
    let _ = tokio::time::timeout(shutdown_timeout, dispatcher_handle).await;
    tracing::info!("Job dispatcher stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly under container orchestrators.
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
