pub mod health;
pub mod products;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", products::router())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Products
        products::list_regions,
        products::get_variant,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            // Models
            crate::models::product::Product,
            crate::models::region::Region,
            crate::models::region::RegionPrice,
            crate::models::variant::VariantPayload,
            crate::listener::supervisor::ListenerPhase,
            // Route request/response types
            health::HealthResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Products", description = "Product catalog"),
    )
)]
pub struct ApiDoc;
