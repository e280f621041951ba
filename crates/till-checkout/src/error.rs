//! Pipeline error taxonomy.

use crate::validator::CartValidation;
use thiserror::Error;
use till_commerce::error::CommerceError;
use till_commerce::ids::ProductId;
use till_commerce::money::Money;
use till_store::StoreError;

/// The specific rule a coupon failed. Surfaced verbatim to the caller;
/// a coupon is never silently ignored.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CouponIneligibleReason {
    UnknownCode { code: String },
    Inactive,
    NotStarted,
    Expired,
    UsageLimitReached,
    UserLimitReached,
    BelowMinimumOrder { minimum: Money },
    AboveMaximumOrder { maximum: Money },
    UserNotEligible,
    ExcludedItem { product_id: ProductId },
    NoEligibleItems,
}

/// Errors from the checkout pipeline.
#[derive(Error, Debug)]
pub enum CheckoutError {
    /// Cart failed re-validation. No side effects occurred.
    #[error("Cart validation failed")]
    Validation(CartValidation),

    /// No cart for the given owner.
    #[error("Cart not found")]
    CartNotFound,

    /// Checkout of an empty cart.
    #[error("Cart is empty")]
    EmptyCart,

    /// Not enough stock; no partial reservation survives. `available`
    /// is the clamp-able quantity.
    #[error("Insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    /// The coupon exists but a rule rejected it.
    #[error("Coupon ineligible: {0:?}")]
    CouponIneligible(CouponIneligibleReason),

    /// The gateway declined the payment. The order moves to
    /// payment_failed and stock is released; retrying checkout is safe.
    #[error("Payment declined: {reason}")]
    PaymentDeclined { reason: String },

    /// The gateway did not answer in time. The order stays pending and
    /// stock stays reserved; the webhook or a poll resolves it later.
    #[error("Payment gateway timed out")]
    GatewayTimeout,

    /// A status change was requested from outside its allowed source
    /// set. The state was not touched.
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// Lock contention aborted the transaction. The whole checkout is
    /// safe to retry.
    #[error("Concurrent update conflict, retry the operation")]
    ConcurrencyConflict,

    /// Ran out of order-number attempts. Practically unreachable with
    /// an 8-character alphabet; surfaced rather than looping forever.
    #[error("Could not allocate a unique order number")]
    OrderNumberExhausted,

    /// Referenced entity missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage failed; the transaction was aborted whole.
    #[error("Storage error: {0}")]
    Storage(StoreError),

    /// Domain invariant violation.
    #[error("Domain error: {0}")]
    Domain(CommerceError),
}

impl From<StoreError> for CheckoutError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockTimeout { .. } => CheckoutError::ConcurrencyConflict,
            StoreError::NotFound { table, key } => {
                CheckoutError::NotFound(format!("{table}:{key}"))
            }
            other => CheckoutError::Storage(other),
        }
    }
}

impl From<CommerceError> for CheckoutError {
    fn from(e: CommerceError) -> Self {
        match e {
            CommerceError::InvalidTransition { from, event } => {
                CheckoutError::InvalidTransition { from, event }
            }
            other => CheckoutError::Domain(other),
        }
    }
}
