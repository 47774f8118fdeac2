use bigdecimal::{BigDecimal, ToPrimitive};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::product_variants;
use crate::models::product::Product;
use crate::models::region::Region;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = product_variants)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ProductVariant {
    pub id: i32,
    pub product_id: i32,
    pub region_id: i32,
    pub price: BigDecimal,
    pub total_companies: i32,
    pub companies_with_email: i32,
    pub companies_with_phone: i32,
    pub companies_with_site: i32,
    pub companies_with_address: i32,
    pub companies_with_activity: i32,
    pub is_active: bool,
}

/// A variant together with the product and region it belongs to.
#[derive(Debug, Clone)]
pub struct VariantDetail {
    pub variant: ProductVariant,
    pub product: Product,
    pub region: Region,
}

/// Transport form of [`VariantDetail`]: integer ids, price as a JSON number,
/// timestamps as RFC 3339 strings or null.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VariantPayload {
    pub id: i32,
    pub price: f64,
    pub total_companies: i32,
    pub companies_with_email: i32,
    pub companies_with_phone: i32,
    pub companies_with_site: i32,
    pub companies_with_address: i32,
    pub companies_with_activity: i32,
    pub is_active: bool,
    pub product: Product,
    pub region: Region,
}

impl From<VariantDetail> for VariantPayload {
    fn from(detail: VariantDetail) -> Self {
        let VariantDetail {
            variant,
            product,
            region,
        } = detail;

        Self {
            id: variant.id,
            price: price_to_f64(&variant.price),
            total_companies: variant.total_companies,
            companies_with_email: variant.companies_with_email,
            companies_with_phone: variant.companies_with_phone,
            companies_with_site: variant.companies_with_site,
            companies_with_address: variant.companies_with_address,
            companies_with_activity: variant.companies_with_activity,
            is_active: variant.is_active,
            product,
            region,
        }
    }
}

/// `NUMERIC(10,2)` always fits an `f64`.
pub fn price_to_f64(price: &BigDecimal) -> f64 {
    price.to_f64().unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::str::FromStr;

    use chrono::{TimeZone, Utc};

    use super::*;

    /// A variant of product 7 ("bakeries") in a region named `region_name`.
    pub fn sample_detail(id: i32, price: &str, region_name: &str) -> VariantDetail {
        VariantDetail {
            variant: ProductVariant {
                id,
                product_id: 7,
                region_id: 3,
                price: BigDecimal::from_str(price).unwrap(),
                total_companies: 1200,
                companies_with_email: 900,
                companies_with_phone: 1100,
                companies_with_site: 400,
                companies_with_address: 1150,
                companies_with_activity: 1000,
                is_active: true,
            },
            product: Product {
                id: 7,
                base_name: "Bakeries".to_string(),
                slug: "bakeries".to_string(),
                description: None,
                image_url: None,
                tags: Some("food".to_string()),
                is_top: true,
                created_at: Some(Utc.with_ymd_and_hms(2025, 1, 31, 20, 30, 0).unwrap()),
                updated_at: None,
            },
            region: Region {
                id: 3,
                name_nominative: region_name.to_string(),
                name_genitive: region_name.to_string(),
                name_prepositional: region_name.to_string(),
                slug: region_name.to_lowercase(),
            },
        }
    }
}
