//! Read endpoints over the product catalog.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::{ApiError, ApiErrorBody};
use crate::models::region::{sort_for_display, RegionPrice};
use crate::models::variant::VariantPayload;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/products/{product_slug}/regions", get(list_regions))
        .route("/products/{product_slug}/{region_slug}", get(get_variant))
}

#[derive(Debug, Deserialize)]
pub struct VariantPath {
    pub product_slug: String,
    pub region_slug: String,
}

// ---------------------------------------------------------------------------
// GET /api/v1/products/:product_slug/regions
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/products/{product_slug}/regions",
    tag = "Products",
    params(
        ("product_slug" = String, Path, description = "Product slug"),
    ),
    responses(
        (status = 200, description = "Regions the product is offered in", body = [RegionPrice]),
        (status = 404, description = "Product not found or not offered anywhere", body = ApiErrorBody),
    ),
)]
pub async fn list_regions(
    State(state): State<AppState>,
    Path(product_slug): Path<String>,
) -> Result<Json<Vec<RegionPrice>>, ApiError> {
    let mut regions = state
        .store
        .regions_for_product(&product_slug)
        .await?
        .ok_or_else(|| ApiError::not_found("Product not found"))?;

    if regions.is_empty() {
        return Err(ApiError::not_found("No regions found for this product"));
    }

    sort_for_display(&mut regions);
    Ok(Json(regions))
}

// ---------------------------------------------------------------------------
// GET /api/v1/products/:product_slug/:region_slug
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/products/{product_slug}/{region_slug}",
    tag = "Products",
    params(
        ("product_slug" = String, Path, description = "Product slug"),
        ("region_slug" = String, Path, description = "Region slug"),
    ),
    responses(
        (status = 200, description = "Variant with its product and region", body = VariantPayload),
        (status = 404, description = "Variant not found", body = ApiErrorBody),
    ),
)]
pub async fn get_variant(
    State(state): State<AppState>,
    Path(path): Path<VariantPath>,
) -> Result<Json<VariantPayload>, ApiError> {
    let detail = state
        .store
        .variant_by_slugs(&path.product_slug, &path.region_slug)
        .await?
        .ok_or_else(|| ApiError::not_found("Product variant not found"))?;

    Ok(Json(detail.into()))
}
