//! Read path into the catalog tables.
//!
//! The relay never trusts the row image carried by a change notification; it
//! re-reads the latest committed state through [`CatalogStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::PoolError;
use diesel_async::RunQueryDsl;
use parking_lot::RwLock;

use crate::db::pool::DbPool;
use crate::db::schema::{product_variants, products, regions};
use crate::models::product::Product;
use crate::models::region::{Region, RegionPrice};
use crate::models::variant::{price_to_f64, ProductVariant, VariantDetail};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("query failed: {0}")]
    Query(#[from] diesel::result::Error),
}

/// Lookups the relay and the HTTP routes need from the catalog.
///
/// Backed by PostgreSQL in production and an in-memory map in tests.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Latest committed state of a variant with its product and region.
    async fn variant_detail(&self, variant_id: i32) -> Result<Option<VariantDetail>, StoreError>;

    /// Variant of `product_slug` offered in `region_slug`.
    async fn variant_by_slugs(
        &self,
        product_slug: &str,
        region_slug: &str,
    ) -> Result<Option<VariantDetail>, StoreError>;

    /// Active regions of a product with their prices, unordered.
    ///
    /// `None` when the product does not exist.
    async fn regions_for_product(
        &self,
        product_slug: &str,
    ) -> Result<Option<Vec<RegionPrice>>, StoreError>;
}

// ---------------------------------------------------------------------------
// PostgreSQL implementation
// ---------------------------------------------------------------------------

pub struct PgCatalogStore {
    db: DbPool,
}

impl PgCatalogStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

type DetailRow = (ProductVariant, Product, Region);

fn into_detail((variant, product, region): DetailRow) -> VariantDetail {
    VariantDetail {
        variant,
        product,
        region,
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn variant_detail(&self, variant_id: i32) -> Result<Option<VariantDetail>, StoreError> {
        let mut conn = self.db.get().await?;

        let row: Option<DetailRow> = product_variants::table
            .inner_join(products::table)
            .inner_join(regions::table)
            .filter(product_variants::id.eq(variant_id))
            .select((
                ProductVariant::as_select(),
                Product::as_select(),
                Region::as_select(),
            ))
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row.map(into_detail))
    }

    async fn variant_by_slugs(
        &self,
        product_slug: &str,
        region_slug: &str,
    ) -> Result<Option<VariantDetail>, StoreError> {
        let mut conn = self.db.get().await?;

        let row: Option<DetailRow> = product_variants::table
            .inner_join(products::table)
            .inner_join(regions::table)
            .filter(products::slug.eq(product_slug))
            .filter(regions::slug.eq(region_slug))
            .select((
                ProductVariant::as_select(),
                Product::as_select(),
                Region::as_select(),
            ))
            .first(&mut conn)
            .await
            .optional()?;

        Ok(row.map(into_detail))
    }

    async fn regions_for_product(
        &self,
        product_slug: &str,
    ) -> Result<Option<Vec<RegionPrice>>, StoreError> {
        let mut conn = self.db.get().await?;

        let product_id: Option<i32> = products::table
            .filter(products::slug.eq(product_slug))
            .select(products::id)
            .first(&mut conn)
            .await
            .optional()?;

        let Some(product_id) = product_id else {
            return Ok(None);
        };

        let rows: Vec<(BigDecimal, Region)> = product_variants::table
            .inner_join(regions::table)
            .filter(product_variants::product_id.eq(product_id))
            .filter(product_variants::is_active.eq(true))
            .select((product_variants::price, Region::as_select()))
            .load(&mut conn)
            .await?;

        Ok(Some(
            rows.into_iter()
                .map(|(price, region)| RegionPrice {
                    name_nominative: region.name_nominative,
                    slug: region.slug,
                    price: price_to_f64(&price),
                })
                .collect(),
        ))
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests)
// ---------------------------------------------------------------------------

pub struct MemoryCatalog {
    variants: RwLock<HashMap<i32, VariantDetail>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            variants: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a variant, keyed by its id.
    pub fn upsert(&self, detail: VariantDetail) {
        self.variants.write().insert(detail.variant.id, detail);
    }

    pub fn remove(&self, variant_id: i32) {
        self.variants.write().remove(&variant_id);
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn variant_detail(&self, variant_id: i32) -> Result<Option<VariantDetail>, StoreError> {
        Ok(self.variants.read().get(&variant_id).cloned())
    }

    async fn variant_by_slugs(
        &self,
        product_slug: &str,
        region_slug: &str,
    ) -> Result<Option<VariantDetail>, StoreError> {
        Ok(self
            .variants
            .read()
            .values()
            .find(|d| d.product.slug == product_slug && d.region.slug == region_slug)
            .cloned())
    }

    async fn regions_for_product(
        &self,
        product_slug: &str,
    ) -> Result<Option<Vec<RegionPrice>>, StoreError> {
        let variants = self.variants.read();
        let of_product: Vec<&VariantDetail> = variants
            .values()
            .filter(|d| d.product.slug == product_slug)
            .collect();

        if of_product.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            of_product
                .into_iter()
                .filter(|d| d.variant.is_active)
                .map(|d| RegionPrice {
                    name_nominative: d.region.name_nominative.clone(),
                    slug: d.region.slug.clone(),
                    price: price_to_f64(&d.variant.price),
                })
                .collect(),
        ))
    }
}
