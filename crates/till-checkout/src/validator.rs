//! Cart re-validation immediately before checkout.
//!
//! Pure read over the catalog: safe to call repeatedly and discard.
//! Errors block checkout; warnings ride along on the response.

use serde::Serialize;
use till_commerce::cart::Cart;
use till_commerce::catalog::ProductCatalog;
use till_commerce::ids::ProductId;
use till_commerce::money::Money;

/// One problem with one cart line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineIssue {
    /// Product inactive or gone from the catalog.
    ProductUnavailable { product_id: ProductId },
    /// Requested more than is in stock. When some stock remains this is
    /// a warning carrying the quantity the line could be clamped to.
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
        clamp_to: Option<i64>,
    },
    /// Live price differs from the price captured in the cart.
    PriceChanged {
        product_id: ProductId,
        captured: Money,
        live: Money,
    },
}

/// Validation verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CartValidation {
    pub errors: Vec<LineIssue>,
    pub warnings: Vec<LineIssue>,
}

impl CartValidation {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Re-validates a cart snapshot against live catalog state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CartValidator;

impl CartValidator {
    pub fn validate(&self, cart: &Cart, catalog: &dyn ProductCatalog) -> CartValidation {
        let mut out = CartValidation::default();

        for line in &cart.lines {
            let Some(product) = catalog.product(&line.product_id) else {
                out.errors.push(LineIssue::ProductUnavailable {
                    product_id: line.product_id.clone(),
                });
                continue;
            };
            if !product.is_active {
                out.errors.push(LineIssue::ProductUnavailable {
                    product_id: line.product_id.clone(),
                });
                continue;
            }

            if product.stock_quantity < line.quantity {
                let issue = LineIssue::InsufficientStock {
                    product_id: line.product_id.clone(),
                    requested: line.quantity,
                    available: product.stock_quantity,
                    clamp_to: (product.stock_quantity > 0).then_some(product.stock_quantity),
                };
                if product.stock_quantity > 0 {
                    // Partially available: suggest the clamp, let the
                    // shopper decide. The cart itself is never mutated
                    // here.
                    out.warnings.push(issue);
                } else {
                    out.errors.push(issue);
                }
            }

            let live = product.effective_price();
            if live != line.unit_price {
                out.warnings.push(LineIssue::PriceChanged {
                    product_id: line.product_id.clone(),
                    captured: line.unit_price,
                    live,
                });
            }
        }

        out
    }
}
