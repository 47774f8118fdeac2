pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod models;
pub mod routes;

use std::sync::Arc;

use tokio::sync::watch;

use config::Config;
use db::pool::DbPool;
use db::store::CatalogStore;
use gateway::registry::ConnectionRegistry;
use listener::supervisor::ListenerPhase;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub store: Arc<dyn CatalogStore>,
    pub connections: Arc<ConnectionRegistry>,
    pub listener_phase: watch::Receiver<ListenerPhase>,
    /// Flips to `true` when the server begins shutting down.
    pub shutdown: watch::Receiver<bool>,
}
