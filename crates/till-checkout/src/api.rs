//! Checkout HTTP contract: DTOs and status mapping.
//!
//! Serving is out of scope; these types pin down the boundary so any
//! HTTP layer maps requests and errors the same way:
//! 201 created / 422 validation / 409 conflict.

use crate::error::{CheckoutError, CouponIneligibleReason};
use crate::orchestrator::CheckoutOutcome;
use crate::validator::LineIssue;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use till_commerce::cart::Address;
use till_commerce::shipping::ShippingSelection;

/// `POST /checkout` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutBody {
    pub cart_id: String,
    pub email: String,
    pub coupon_code: Option<String>,
    pub shipping_selection: ShippingSelection,
    pub shipping_address: Address,
    pub billing_address: Option<Address>,
}

/// 201 response body.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutCreated {
    pub order_number: String,
    /// Major-unit total for display; minor units ride in `total_cents`.
    pub total: String,
    pub total_cents: i64,
    pub currency: String,
    /// Present unless the gateway timed out; the client polls in that
    /// case.
    pub payment_client_secret: Option<String>,
    pub warnings: Vec<LineIssue>,
}

impl CheckoutCreated {
    pub fn from_outcome(outcome: &CheckoutOutcome) -> Self {
        let total = outcome.order.totals.total_amount;
        Self {
            order_number: outcome.order.order_number.clone(),
            total: total.display(),
            total_cents: total.amount_cents,
            currency: total.currency.code().to_string(),
            payment_client_secret: outcome
                .payment
                .as_ref()
                .and_then(|p| p.client_secret.clone()),
            warnings: outcome.warnings.clone(),
        }
    }
}

/// 422 body: user-fixable problems.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationBody {
    pub errors: Vec<LineIssue>,
    pub warnings: Vec<LineIssue>,
}

/// 409 body: state conflicts (stock, coupon, concurrent update).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "conflict", rename_all = "snake_case")]
pub enum ConflictBody {
    InsufficientStock {
        product_id: String,
        requested: i64,
        available: i64,
    },
    CouponIneligible {
        #[serde(flatten)]
        reason: CouponIneligibleReason,
    },
    ConcurrentUpdate,
    InvalidTransition {
        from: String,
        event: String,
    },
}

/// Map a pipeline error to the contract's status code.
pub fn status_for(error: &CheckoutError) -> StatusCode {
    match error {
        CheckoutError::Validation(_)
        | CheckoutError::CartNotFound
        | CheckoutError::EmptyCart
        | CheckoutError::Domain(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CheckoutError::InsufficientStock { .. }
        | CheckoutError::CouponIneligible(_)
        | CheckoutError::ConcurrencyConflict
        | CheckoutError::InvalidTransition { .. } => StatusCode::CONFLICT,
        CheckoutError::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
        CheckoutError::NotFound(_) => StatusCode::NOT_FOUND,
        CheckoutError::GatewayTimeout => StatusCode::ACCEPTED,
        CheckoutError::OrderNumberExhausted | CheckoutError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Build the error body for a 409/422-class error, if it has one.
pub fn body_for(error: &CheckoutError) -> Option<serde_json::Value> {
    match error {
        CheckoutError::Validation(validation) => serde_json::to_value(ValidationBody {
            errors: validation.errors.clone(),
            warnings: validation.warnings.clone(),
        })
        .ok(),
        CheckoutError::InsufficientStock {
            product_id,
            requested,
            available,
        } => serde_json::to_value(ConflictBody::InsufficientStock {
            product_id: product_id.to_string(),
            requested: *requested,
            available: *available,
        })
        .ok(),
        CheckoutError::CouponIneligible(reason) => {
            serde_json::to_value(ConflictBody::CouponIneligible {
                reason: reason.clone(),
            })
            .ok()
        }
        CheckoutError::ConcurrencyConflict => {
            serde_json::to_value(ConflictBody::ConcurrentUpdate).ok()
        }
        CheckoutError::InvalidTransition { from, event } => {
            serde_json::to_value(ConflictBody::InvalidTransition {
                from: from.clone(),
                event: event.clone(),
            })
            .ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use till_commerce::ids::ProductId;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&CheckoutError::Validation(Default::default())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&CheckoutError::InsufficientStock {
                product_id: ProductId::new("prd_a"),
                requested: 2,
                available: 1,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CheckoutError::CouponIneligible(
                CouponIneligibleReason::UsageLimitReached
            )),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CheckoutError::GatewayTimeout),
            StatusCode::ACCEPTED
        );
    }

    #[test]
    fn test_conflict_body_shape() {
        let body = body_for(&CheckoutError::InsufficientStock {
            product_id: ProductId::new("prd_a"),
            requested: 2,
            available: 1,
        })
        .unwrap();
        assert_eq!(body["conflict"], "insufficient_stock");
        assert_eq!(body["available"], 1);

        let body = body_for(&CheckoutError::CouponIneligible(
            CouponIneligibleReason::UsageLimitReached,
        ))
        .unwrap();
        assert_eq!(body["conflict"], "coupon_ineligible");
        assert_eq!(body["rule"], "usage_limit_reached");
    }
}
