use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use catalog_api::config::Config;
use catalog_api::db::store::{CatalogStore, PgCatalogStore};
use catalog_api::gateway::registry::ConnectionRegistry;
use catalog_api::listener::feed::PgFeedConnector;
use catalog_api::listener::supervisor::Supervisor;
use catalog_api::listener::ChangeListener;
use catalog_api::AppState;

/// How long open realtime connections get to close after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // Query pool for the read path. The listener gets its own connection.
    let db = catalog_api::db::pool::connect(&config.database_url);
    let store: Arc<dyn CatalogStore> = Arc::new(PgCatalogStore::new(db.clone()));
    let connections = Arc::new(ConnectionRegistry::new());

    let listener = ChangeListener::new(
        Arc::new(PgFeedConnector::new(config.database_url.clone())),
        store.clone(),
        connections.clone(),
    );
    let supervisor = Supervisor::spawn(listener, config.notify_channel.clone());

    tracing::info!(channel = %config.notify_channel, "catalog-api configured");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState {
        db,
        config: Arc::new(config),
        store,
        connections: connections.clone(),
        listener_phase: supervisor.phase(),
        shutdown: shutdown_rx,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(catalog_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "catalog-api listening");

    let tcp = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(tcp, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Upgraded sockets are not tracked by axum; tell them to close.
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("server error");

    supervisor.shutdown().await;
    if !connections.wait_until_empty(DRAIN_TIMEOUT).await {
        tracing::warn!(remaining = connections.count(), "realtime connections still open at exit");
    }
    tracing::info!("catalog-api stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
