//! Shipping rate seam and cost arithmetic.
//!
//! Rate *lookup* is owned elsewhere; this module defines the provider
//! contract and a table-driven default used by tests and small
//! deployments. Cost arithmetic feeds the order totals.

use crate::money::{Currency, Money};
use serde::{Deserialize, Serialize};

/// Destination zone, as resolved by the caller from the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShippingZone {
    #[default]
    Domestic,
    Regional,
    International,
}

impl ShippingZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingZone::Domestic => "domestic",
            ShippingZone::Regional => "regional",
            ShippingZone::International => "international",
        }
    }
}

/// The shipping choice a checkout submits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShippingSelection {
    /// Method name, carried onto the order for display.
    pub method: String,
    pub zone: ShippingZone,
}

/// Pure rate lookup: (zone, weight, subtotal) -> cost.
pub trait ShippingRateProvider: Send + Sync {
    fn rate(&self, zone: ShippingZone, weight_grams: i64, subtotal: Money) -> Money;
}

/// One rate band of the default provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateBand {
    pub zone: ShippingZone,
    /// Flat cost for the band.
    pub base: Money,
    /// Added per started kilogram above the first.
    pub per_extra_kg: Money,
}

/// Table-driven rate provider with an optional free-shipping threshold.
#[derive(Debug, Clone)]
pub struct BandedRateProvider {
    bands: Vec<RateBand>,
    /// Subtotal at or above which shipping is free.
    free_over: Option<Money>,
    currency: Currency,
}

impl BandedRateProvider {
    pub fn new(bands: Vec<RateBand>, free_over: Option<Money>, currency: Currency) -> Self {
        Self {
            bands,
            free_over,
            currency,
        }
    }

    /// Flat 5.00 domestic / 12.00 regional / 25.00 international.
    pub fn standard(currency: Currency) -> Self {
        let flat = |zone, cents| RateBand {
            zone,
            base: Money::new(cents, currency),
            per_extra_kg: Money::zero(currency),
        };
        Self::new(
            vec![
                flat(ShippingZone::Domestic, 500),
                flat(ShippingZone::Regional, 1200),
                flat(ShippingZone::International, 2500),
            ],
            None,
            currency,
        )
    }
}

impl ShippingRateProvider for BandedRateProvider {
    fn rate(&self, zone: ShippingZone, weight_grams: i64, subtotal: Money) -> Money {
        if let Some(threshold) = self.free_over {
            if subtotal.amount_cents >= threshold.amount_cents {
                return Money::zero(self.currency);
            }
        }
        let Some(band) = self.bands.iter().find(|b| b.zone == zone) else {
            return Money::zero(self.currency);
        };
        // First kilogram is covered by the base rate.
        let extra_kg = ((weight_grams - 1000).max(0) + 999) / 1000;
        band.base + band.per_extra_kg.times(extra_kg)
    }
}
