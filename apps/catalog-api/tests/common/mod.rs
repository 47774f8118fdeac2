use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use bigdecimal::BigDecimal;
use tokio::sync::watch;
use tokio::time;

use catalog_api::config::{Config, DEFAULT_NOTIFY_CHANNEL};
use catalog_api::db::store::MemoryCatalog;
use catalog_api::gateway::registry::ConnectionRegistry;
use catalog_api::listener::feed::MemoryFeedConnector;
use catalog_api::listener::supervisor::{ListenerPhase, Supervisor, SupervisorHandle};
use catalog_api::listener::ChangeListener;
use catalog_api::models::product::Product;
use catalog_api::models::region::Region;
use catalog_api::models::variant::{ProductVariant, VariantDetail};
use catalog_api::AppState;

/// Application wired to in-memory collaborators instead of PostgreSQL.
pub struct TestApp {
    pub state: AppState,
    pub catalog: Arc<MemoryCatalog>,
    pub feed: Arc<MemoryFeedConnector>,
    pub supervisor: SupervisorHandle,
    pub shutdown: watch::Sender<bool>,
}

impl TestApp {
    pub fn router(&self) -> Router {
        catalog_api::routes::router().with_state(self.state.clone())
    }

    /// Publish a change event the way the database trigger would.
    pub fn notify(&self, table: &str, operation: &str, id: i32) {
        let payload = serde_json::json!({
            "table": table,
            "operation": operation,
            "data": { "id": id },
            "timestamp": 1738355400.0,
        });
        self.feed.notify(DEFAULT_NOTIFY_CHANNEL, &payload.to_string());
    }

    pub async fn wait_for_subscription(&self) {
        let mut phase = self.supervisor.phase();
        time::timeout(
            Duration::from_secs(5),
            phase.wait_for(|p| *p == ListenerPhase::Subscribed),
        )
        .await
        .expect("timeout waiting for listener")
        .expect("supervisor stopped");
    }

    /// Poll until the registry holds `expected` connections.
    pub async fn wait_for_connections(&self, expected: usize) {
        let connections = self.state.connections.clone();
        time::timeout(Duration::from_secs(5), async move {
            while connections.count() != expected {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for {expected} connections"));
    }
}

/// Build the app with a supervised listener on an in-memory feed.
pub async fn test_app() -> TestApp {
    let config = Config {
        // The pool connects lazily and no test here issues a query on it.
        database_url: "postgres://localhost/catalog_test".to_string(),
        port: 0,
        notify_channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
    };
    let db = catalog_api::db::pool::connect(&config.database_url);

    let catalog = Arc::new(MemoryCatalog::new());
    let feed = Arc::new(MemoryFeedConnector::new());
    let connections = Arc::new(ConnectionRegistry::new());

    let listener = ChangeListener::new(feed.clone(), catalog.clone(), connections.clone());
    let supervisor = Supervisor::spawn(listener, config.notify_channel.clone());
    let (shutdown, shutdown_rx) = watch::channel(false);

    let state = AppState {
        db,
        config: Arc::new(config),
        store: catalog.clone(),
        connections,
        listener_phase: supervisor.phase(),
        shutdown: shutdown_rx,
    };

    TestApp {
        state,
        catalog,
        feed,
        supervisor,
        shutdown,
    }
}

/// A variant of `product_slug` in the region `region_slug`.
pub fn variant(
    id: i32,
    price: &str,
    product_slug: &str,
    region_name: &str,
    region_slug: &str,
) -> VariantDetail {
    VariantDetail {
        variant: ProductVariant {
            id,
            product_id: 1,
            region_id: id,
            price: BigDecimal::from_str(price).expect("price"),
            total_companies: 500,
            companies_with_email: 300,
            companies_with_phone: 450,
            companies_with_site: 120,
            companies_with_address: 480,
            companies_with_activity: 400,
            is_active: true,
        },
        product: Product {
            id: 1,
            base_name: "Bakeries".to_string(),
            slug: product_slug.to_string(),
            description: Some("Bakery contact database".to_string()),
            image_url: None,
            tags: None,
            is_top: false,
            created_at: None,
            updated_at: None,
        },
        region: Region {
            id,
            name_nominative: region_name.to_string(),
            name_genitive: region_name.to_string(),
            name_prepositional: region_name.to_string(),
            slug: region_slug.to_string(),
        },
    }
}
