//! Domain error types.

use thiserror::Error;

/// Errors from pure domain operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommerceError {
    /// Quantity must be positive.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    /// Quantity exceeds the per-line maximum.
    #[error("Quantity {0} exceeds maximum allowed ({1})")]
    QuantityExceedsLimit(i64, i64),

    /// Arithmetic overflow in a money calculation.
    #[error("Arithmetic overflow in money calculation")]
    Overflow,

    /// Mixed currencies in one computation.
    #[error("Currency mismatch: expected {expected}, got {got}")]
    CurrencyMismatch { expected: String, got: String },

    /// Line not present in the cart.
    #[error("Line not in cart: {0}")]
    LineNotInCart(String),

    /// A status change was requested from a state outside the
    /// transition's allowed source set.
    #[error("Invalid order transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// Coupon definition rejected at write time.
    #[error("Invalid coupon definition: {0}")]
    InvalidCoupon(String),

    /// Order totals do not satisfy the totals invariant.
    #[error("Order totals inconsistent: {0}")]
    InconsistentTotals(String),
}
