use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::regions;

/// Region slug that is listed ahead of all other regions.
pub const COUNTRY_WIDE_SLUG: &str = "russia";

#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = regions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Region {
    pub id: i32,
    pub name_nominative: String,
    pub name_genitive: String,
    pub name_prepositional: String,
    pub slug: String,
}

/// A region a product is offered in, with the variant price there.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RegionPrice {
    pub name_nominative: String,
    pub slug: String,
    pub price: f64,
}

/// Orders regions for display: the country-wide region first, the rest by name.
pub fn sort_for_display(regions: &mut [RegionPrice]) {
    regions.sort_by(|a, b| {
        let a_first = a.slug == COUNTRY_WIDE_SLUG;
        let b_first = b.slug == COUNTRY_WIDE_SLUG;
        b_first
            .cmp(&a_first)
            .then_with(|| a.name_nominative.cmp(&b.name_nominative))
    });
}
