//! Orders, order items and the guarded status state machine.

use crate::cart::Address;
use crate::error::CommerceError;
use crate::ids::{OrderId, OrderItemId, ProductId, UserId};
use crate::money::{Currency, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    PaymentFailed,
    Refunded,
    Disputed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Disputed => "disputed",
        }
    }

    /// States with captured payment.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed
                | OrderStatus::Processing
                | OrderStatus::Shipped
                | OrderStatus::Delivered
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }
}

/// Payment status, shared by orders and payment records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    PartiallyRefunded,
    Refunded,
    Disputed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Disputed => "disputed",
        }
    }
}

/// Events that drive order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEvent {
    PaymentSucceeded,
    PaymentFailed,
    Cancel,
    StartProcessing,
    Ship,
    Deliver,
    Refund,
    Dispute,
}

impl OrderEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEvent::PaymentSucceeded => "payment_succeeded",
            OrderEvent::PaymentFailed => "payment_failed",
            OrderEvent::Cancel => "cancel",
            OrderEvent::StartProcessing => "start_processing",
            OrderEvent::Ship => "ship",
            OrderEvent::Deliver => "deliver",
            OrderEvent::Refund => "refund",
            OrderEvent::Dispute => "dispute",
        }
    }
}

/// The transition table.
///
/// `None` means the event is not allowed from this state. Callers treat
/// that as a guarded no-op and report it; they never force the change.
/// This guard is what makes duplicated and out-of-order webhook
/// deliveries safe to apply blindly.
pub fn next_status(current: OrderStatus, event: OrderEvent) -> Option<OrderStatus> {
    use OrderEvent as E;
    use OrderStatus as S;
    match (current, event) {
        (S::Pending, E::PaymentSucceeded) => Some(S::Confirmed),
        (S::Pending, E::PaymentFailed) => Some(S::PaymentFailed),
        (S::Pending | S::Confirmed, E::Cancel) => Some(S::Cancelled),
        (S::Confirmed, E::StartProcessing) => Some(S::Processing),
        (S::Processing, E::Ship) => Some(S::Shipped),
        (S::Shipped, E::Deliver) => Some(S::Delivered),
        (s, E::Refund) if s.is_paid() => Some(S::Refunded),
        (S::Confirmed, E::Dispute) => Some(S::Disputed),
        _ => None,
    }
}

/// Monetary breakdown of an order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OrderTotals {
    pub subtotal: Money,
    pub discount_amount: Money,
    pub shipping_amount: Money,
    pub tax_amount: Money,
    pub total_amount: Money,
}

impl OrderTotals {
    /// Compute totals, enforcing
    /// `total = subtotal - discount + shipping + tax`.
    pub fn compute(
        subtotal: Money,
        discount_amount: Money,
        shipping_amount: Money,
        tax_amount: Money,
    ) -> Result<Self, CommerceError> {
        let after_discount = subtotal
            .try_sub(&discount_amount)
            .ok_or(CommerceError::CurrencyMismatch {
                expected: subtotal.currency.to_string(),
                got: discount_amount.currency.to_string(),
            })?;
        if after_discount.is_negative() {
            return Err(CommerceError::InconsistentTotals(format!(
                "discount {} exceeds subtotal {}",
                discount_amount, subtotal
            )));
        }
        let total_amount = after_discount + shipping_amount + tax_amount;
        Ok(Self {
            subtotal,
            discount_amount,
            shipping_amount,
            tax_amount,
            total_amount,
        })
    }

    /// Re-check the invariant on a stored order.
    pub fn verify(&self) -> bool {
        self.subtotal.amount_cents - self.discount_amount.amount_cents
            + self.shipping_amount.amount_cents
            + self.tax_amount.amount_cents
            == self.total_amount.amount_cents
    }
}

/// A frozen order line. Never recomputed from live product data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub product_id: ProductId,
    /// Product name at checkout.
    pub name: String,
    pub quantity: i64,
    /// Unit price at checkout.
    pub unit_price: Money,
    pub line_total: Money,
}

impl OrderItem {
    pub fn freeze(
        product_id: ProductId,
        name: impl Into<String>,
        quantity: i64,
        unit_price: Money,
    ) -> Self {
        Self {
            id: OrderItemId::generate(),
            product_id,
            name: name.into(),
            quantity,
            unit_price,
            line_total: unit_price.times(quantity),
        }
    }
}

/// An order. Created once, atomically with its items and stock
/// reservations; afterwards only status fields and the admin note move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    /// Globally unique, human-legible.
    pub order_number: String,
    pub user_id: Option<UserId>,
    pub email: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub items: Vec<OrderItem>,
    pub totals: OrderTotals,
    pub currency: Currency,
    /// Redeemed coupon code, if any.
    pub coupon_code: Option<String>,
    pub shipping_address: Address,
    pub billing_address: Address,
    pub admin_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Apply an event through the guard.
    ///
    /// Returns the new status, or `InvalidTransition` without touching
    /// anything when the current status is not in the event's source
    /// set.
    pub fn apply(
        &mut self,
        event: OrderEvent,
        now: DateTime<Utc>,
    ) -> Result<OrderStatus, CommerceError> {
        let next = next_status(self.status, event).ok_or(CommerceError::InvalidTransition {
            from: self.status.as_str().to_string(),
            event: event.as_str().to_string(),
        })?;
        self.status = next;
        self.updated_at = now;
        if next == OrderStatus::Cancelled {
            self.cancelled_at = Some(now);
        }
        Ok(next)
    }

    pub fn set_payment_status(&mut self, status: PaymentStatus, now: DateTime<Utc>) {
        self.payment_status = status;
        self.updated_at = now;
    }

    /// Admin notes are the only free-text field that stays mutable
    /// after creation.
    pub fn set_admin_note(&mut self, note: impl Into<String>, now: DateTime<Utc>) {
        self.admin_note = Some(note.into());
        self.updated_at = now;
    }

    pub fn item_quantity(&self) -> i64 {
        self.items.iter().map(|i| i.quantity).sum()
    }
}

/// Alphabet for order numbers: uppercase, no lookalike characters.
const ORDER_NUMBER_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTVWXYZ23456789";

/// Length of the random part of an order number.
const ORDER_NUMBER_LEN: usize = 8;

/// Generate a candidate order number, e.g. `TL-K7M2Q9XW`.
///
/// Uniqueness is enforced by the caller against the order store, with
/// bounded retries on collision.
pub fn generate_order_number() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ORDER_NUMBER_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ORDER_NUMBER_ALPHABET.len());
            ORDER_NUMBER_ALPHABET[idx] as char
        })
        .collect();
    format!("TL-{suffix}")
}
