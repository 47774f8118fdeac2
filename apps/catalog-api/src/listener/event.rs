//! Change events published by the `notify_data_change()` trigger.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Tables the trigger is installed on.
pub mod tables {
    pub const PRODUCT_VARIANTS: &str = "product_variants";
    pub const PRODUCTS: &str = "products";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// One row mutation as emitted on the notification channel.
///
/// `data` is the row image at trigger time (`OLD` for deletes). It is a
/// wake-up hint only; the relay re-reads the row before broadcasting.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub operation: Operation,
    pub data: Map<String, Value>,
    /// Seconds since the Unix epoch, from `extract(epoch from now())`.
    pub timestamp: f64,
}

impl ChangeEvent {
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// The row's `id`, if present and an integer that fits the column.
    pub fn entity_id(&self) -> Option<i32> {
        self.data
            .get("id")
            .and_then(Value::as_i64)
            .and_then(|id| i32::try_from(id).ok())
    }

    /// When the writing transaction ran the trigger.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        if !self.timestamp.is_finite() {
            return None;
        }
        let secs = self.timestamp.trunc() as i64;
        let nanos = (self.timestamp.fract() * 1e9).round() as u32;
        DateTime::from_timestamp(secs, nanos.min(999_999_999))
    }
}
