//! The discount engine: coupon validation against live state, then
//! pricing.
//!
//! Validation runs inside the checkout transaction with the coupon row
//! locked, so the usage-limit check and the usage insert sit in one
//! serialized window. Counting always goes through `CouponUsage` rows;
//! there is no cached counter to race against.

use crate::error::{CheckoutError, CouponIneligibleReason};
use std::sync::Arc;
use till_commerce::clock::Clock;
use till_commerce::coupon::{
    discount_for, match_restrictions, user_allowed, Coupon, EligibleLine, UserContext,
};
use till_commerce::money::Money;
use till_store::repos::{coupons, usages};
use till_store::{StoreError, Tx};

/// A coupon that passed every check, priced against the cart.
#[derive(Debug, Clone)]
pub struct AppliedCoupon {
    pub coupon: Coupon,
    pub discount: Money,
    pub free_shipping: bool,
}

/// Validates and prices coupons.
#[derive(Clone)]
pub struct DiscountEngine {
    clock: Arc<dyn Clock>,
}

impl DiscountEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Run the eligibility checks in order, short-circuiting on the
    /// first failure, then price the coupon. Takes the coupon row lock.
    ///
    /// Check order: active flag, time window, global usage, per-user
    /// usage, order amount bounds, user eligibility, line restrictions.
    pub fn validate_and_price(
        &self,
        tx: &mut Tx<'_>,
        code: &str,
        lines: &[EligibleLine],
        subtotal: Money,
        user: &UserContext,
    ) -> Result<AppliedCoupon, CheckoutError> {
        use CouponIneligibleReason as Reason;

        let coupon = match coupons::lock_by_code(tx, code) {
            Ok(coupon) => coupon,
            Err(StoreError::NotFound { .. }) => {
                return Err(CheckoutError::CouponIneligible(Reason::UnknownCode {
                    code: code.to_uppercase(),
                }))
            }
            Err(e) => return Err(e.into()),
        };

        if !coupon.active {
            return Err(CheckoutError::CouponIneligible(Reason::Inactive));
        }

        let now = self.clock.now();
        if coupon.starts_at.is_some_and(|starts| now < starts) {
            return Err(CheckoutError::CouponIneligible(Reason::NotStarted));
        }
        if coupon.expires_at.is_some_and(|expires| now > expires) {
            return Err(CheckoutError::CouponIneligible(Reason::Expired));
        }

        if let Some(limit) = coupon.usage_limit {
            if usages::count_for_coupon(tx, &coupon.id) >= limit {
                return Err(CheckoutError::CouponIneligible(Reason::UsageLimitReached));
            }
        }
        if let (Some(limit), Some(user_id)) = (coupon.usage_limit_per_user, &user.user_id) {
            if usages::count_for_user(tx, &coupon.id, user_id) >= limit {
                return Err(CheckoutError::CouponIneligible(Reason::UserLimitReached));
            }
        }

        if let Some(minimum) = coupon.min_order_amount {
            if subtotal.amount_cents < minimum.amount_cents {
                return Err(CheckoutError::CouponIneligible(Reason::BelowMinimumOrder {
                    minimum,
                }));
            }
        }
        if let Some(maximum) = coupon.max_order_amount {
            if subtotal.amount_cents > maximum.amount_cents {
                return Err(CheckoutError::CouponIneligible(Reason::AboveMaximumOrder {
                    maximum,
                }));
            }
        }

        if !user_allowed(&coupon.restrictions, user) {
            return Err(CheckoutError::CouponIneligible(Reason::UserNotEligible));
        }

        let matched = match_restrictions(&coupon.restrictions, lines);
        if let Some(product_id) = matched.exclusion_hit {
            return Err(CheckoutError::CouponIneligible(Reason::ExcludedItem {
                product_id,
            }));
        }
        if matched.eligible.is_empty() {
            return Err(CheckoutError::CouponIneligible(Reason::NoEligibleItems));
        }

        let eligible: Vec<EligibleLine> = matched
            .eligible
            .iter()
            .map(|&idx| lines[idx].clone())
            .collect();
        let discount = discount_for(&coupon, &eligible);
        let free_shipping = coupon.grants_free_shipping();

        tracing::debug!(
            code = %coupon.code,
            discount = %discount,
            free_shipping,
            "coupon priced"
        );

        Ok(AppliedCoupon {
            coupon,
            discount,
            free_shipping,
        })
    }
}
