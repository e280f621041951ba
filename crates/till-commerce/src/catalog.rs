//! Product snapshots as this core reads them.
//!
//! The product catalog is owned elsewhere; the pipeline only reads the
//! fields checkout needs. All stock writes go through the inventory
//! ledger, never through this view.

use crate::ids::{CategoryId, ProductId};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The slice of a product the fulfillment pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductSnapshot {
    /// Product identifier.
    pub id: ProductId,
    /// Display name, frozen into order items.
    pub name: String,
    /// List price.
    pub price: Money,
    /// Sale price; when set, this is the effective price.
    pub sale_price: Option<Money>,
    /// Current sellable stock. Never negative.
    pub stock_quantity: i64,
    /// Inactive products cannot be checked out.
    pub is_active: bool,
    /// Unit weight in grams, for shipping cost.
    pub weight_grams: i64,
    /// Categories, for coupon restriction matching.
    pub category_ids: Vec<CategoryId>,
    /// Last catalog update.
    pub updated_at: DateTime<Utc>,
}

impl ProductSnapshot {
    /// The price a checkout pays right now.
    pub fn effective_price(&self) -> Money {
        self.sale_price.unwrap_or(self.price)
    }

    /// Whether `quantity` units could be sold from current stock.
    pub fn can_fulfill(&self, quantity: i64) -> bool {
        self.is_active && self.stock_quantity >= quantity
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.stock_quantity <= 0
    }
}

/// Read-only product lookup.
///
/// Implemented by the store-backed catalog in `till-store`; tests use
/// in-memory maps.
pub trait ProductCatalog: Send + Sync {
    /// Fetch a product snapshot, `None` if unknown.
    fn product(&self, id: &ProductId) -> Option<ProductSnapshot>;
}
