//! Shipping cost computation for checkout.
//!
//! Stateless: rate lookup is delegated to the provider, and a
//! free-shipping coupon zeroes the result here rather than appearing as
//! a discount amount.

use std::sync::Arc;
use till_commerce::money::Money;
use till_commerce::shipping::{ShippingRateProvider, ShippingSelection};

/// Maps (cart weight, subtotal, zone) to a shipping cost.
#[derive(Clone)]
pub struct ShippingCostCalculator {
    provider: Arc<dyn ShippingRateProvider>,
}

impl ShippingCostCalculator {
    pub fn new(provider: Arc<dyn ShippingRateProvider>) -> Self {
        Self { provider }
    }

    pub fn compute(
        &self,
        selection: &ShippingSelection,
        total_weight_grams: i64,
        subtotal: Money,
        free_shipping: bool,
    ) -> Money {
        if free_shipping {
            return Money::zero(subtotal.currency);
        }
        self.provider
            .rate(selection.zone, total_weight_grams, subtotal)
    }
}
