//! Persistent record types owned by the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use till_commerce::ids::{AlertId, CouponId, MovementId, OrderId, PaymentId, ProductId, UserId};
use till_commerce::money::Money;
use till_commerce::order::PaymentStatus;

/// Kind of stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    /// Provisional decrement tied to an order.
    Reserve,
    /// Reservation returned (cancel, payment failure).
    Release,
    /// Admin direct set.
    Adjust,
    /// Inbound stock.
    Restock,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Reserve => "reserve",
            MovementKind::Release => "release",
            MovementKind::Adjust => "adjust",
            MovementKind::Restock => "restock",
        }
    }
}

/// An immutable entry in the stock-movement log.
///
/// For every movement `new_stock = old_stock + signed_delta()`, and a
/// product's counter always equals the sum of its movements' signed
/// deltas over its initial stock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryMovement {
    pub id: MovementId,
    pub product_id: ProductId,
    pub kind: MovementKind,
    /// Magnitude of the change; always positive.
    pub quantity: i64,
    pub old_stock: i64,
    pub new_stock: i64,
    pub reason: String,
    /// Order this movement correlates to, when any.
    pub order_id: Option<OrderId>,
    pub created_at: DateTime<Utc>,
}

impl InventoryMovement {
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        product_id: ProductId,
        kind: MovementKind,
        quantity: i64,
        old_stock: i64,
        new_stock: i64,
        reason: impl Into<String>,
        order_id: Option<OrderId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(quantity >= 0);
        debug_assert_eq!(new_stock - old_stock, signed(kind, quantity, old_stock, new_stock));
        Self {
            id: MovementId::generate(),
            product_id,
            kind,
            quantity,
            old_stock,
            new_stock,
            reason: reason.into(),
            order_id,
            created_at,
        }
    }

    /// The movement's effect on the stock counter.
    pub fn signed_delta(&self) -> i64 {
        signed(self.kind, self.quantity, self.old_stock, self.new_stock)
    }
}

fn signed(kind: MovementKind, quantity: i64, old_stock: i64, new_stock: i64) -> i64 {
    match kind {
        MovementKind::Reserve => -quantity,
        MovementKind::Release | MovementKind::Restock => quantity,
        MovementKind::Adjust => new_stock - old_stock,
    }
}

/// One successful coupon redemption.
///
/// Row existence is the sole source of truth for usage counting; there
/// is no cached counter to drift. Cancelled orders keep their row
/// (tagged) and still count against the limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CouponUsage {
    pub id: till_commerce::ids::UsageId,
    pub coupon_id: CouponId,
    pub user_id: Option<UserId>,
    pub order_id: OrderId,
    pub discount_amount: Money,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl CouponUsage {
    pub fn redeem(
        coupon_id: CouponId,
        user_id: Option<UserId>,
        order_id: OrderId,
        discount_amount: Money,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: till_commerce::ids::UsageId::generate(),
            coupon_id,
            user_id,
            order_id,
            discount_amount,
            cancelled: false,
            created_at,
        }
    }
}

/// A payment intent as this system tracks it.
///
/// `intent_id` is the gateway's identifier and the idempotency key:
/// unique here, so a duplicate persist attempt surfaces as a duplicate
/// key instead of a second row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub intent_id: String,
    pub amount: Money,
    pub status: PaymentStatus,
    pub refunded_amount: Money,
    /// Handed to the storefront to finish payment client-side.
    pub client_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn pending(
        order_id: OrderId,
        intent_id: impl Into<String>,
        amount: Money,
        client_secret: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::generate(),
            order_id,
            intent_id: intent_id.into(),
            amount,
            status: PaymentStatus::Pending,
            refunded_amount: Money::zero(amount.currency),
            client_secret,
            created_at,
            updated_at: created_at,
        }
    }

    /// Amount still refundable.
    pub fn refundable(&self) -> Money {
        self.amount.saturating_sub(&self.refunded_amount)
    }
}

/// Stock alert kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowStock,
    OutOfStock,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LowStock => "low_stock",
            AlertKind::OutOfStock => "out_of_stock",
        }
    }
}

/// A deduped stock alert: at most one open alert per (product, kind).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockAlert {
    pub id: AlertId,
    pub product_id: ProductId,
    pub kind: AlertKind,
    pub open: bool,
    /// Stock level that triggered the alert.
    pub stock_at_trigger: i64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl StockAlert {
    pub fn open_now(
        product_id: ProductId,
        kind: AlertKind,
        stock_at_trigger: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::generate(),
            product_id,
            kind,
            open: true,
            stock_at_trigger,
            created_at,
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use till_commerce::money::Currency;

    #[test]
    fn test_movement_signed_delta() {
        let now = Utc::now();
        let reserve = InventoryMovement::record(
            ProductId::new("prd_a"),
            MovementKind::Reserve,
            3,
            5,
            2,
            "checkout",
            Some(OrderId::new("ord_1")),
            now,
        );
        assert_eq!(reserve.signed_delta(), -3);

        let release = InventoryMovement::record(
            ProductId::new("prd_a"),
            MovementKind::Release,
            3,
            2,
            5,
            "cancel",
            Some(OrderId::new("ord_1")),
            now,
        );
        assert_eq!(release.signed_delta(), 3);

        let adjust = InventoryMovement::record(
            ProductId::new("prd_a"),
            MovementKind::Adjust,
            4,
            5,
            1,
            "stocktake",
            None,
            now,
        );
        assert_eq!(adjust.signed_delta(), -4);
    }

    #[test]
    fn test_payment_refundable() {
        let mut payment = Payment::pending(
            OrderId::new("ord_1"),
            "pi_abc",
            Money::new(5450, Currency::USD),
            None,
            Utc::now(),
        );
        assert_eq!(payment.refundable().amount_cents, 5450);
        payment.refunded_amount = Money::new(5000, Currency::USD);
        assert_eq!(payment.refundable().amount_cents, 450);
    }
}
