//! Repository functions.
//!
//! Every function takes the transaction handle explicitly. Functions
//! named `*_for_update` take the row's exclusive lock before reading;
//! plain writes are rejected unless the lock is already held, which
//! keeps read-check-write cycles honest by construction.

use crate::error::StoreError;
use crate::store::Tx;

const PRODUCTS: &str = "products";
const COUPONS: &str = "coupons";
const ORDERS: &str = "orders";
const ORDER_NUMBERS: &str = "order_numbers";
const PAYMENTS: &str = "payments";
const PAYMENT_INTENTS: &str = "payment_intents";

/// Product snapshots. Stock on these rows moves only through the
/// inventory ledger, which funnels into [`put`] under the row lock.
pub mod products {
    use super::*;
    use till_commerce::catalog::ProductSnapshot;
    use till_commerce::ids::ProductId;

    /// Read a product, seeing this transaction's own writes first.
    pub fn get(tx: &Tx<'_>, id: &ProductId) -> Option<ProductSnapshot> {
        if let Some(staged) = tx.writes.products.get(id) {
            return Some(staged.clone());
        }
        tx.tables().products.get(id).cloned()
    }

    /// Lock the product row, then read it.
    pub fn get_for_update(tx: &mut Tx<'_>, id: &ProductId) -> Result<ProductSnapshot, StoreError> {
        tx.lock_row(PRODUCTS, id.as_str())?;
        get(tx, id).ok_or_else(|| StoreError::NotFound {
            table: PRODUCTS,
            key: id.to_string(),
        })
    }

    /// Stage a product write. The row lock must already be held.
    pub fn put(tx: &mut Tx<'_>, product: ProductSnapshot) -> Result<(), StoreError> {
        if !tx.holds(PRODUCTS, product.id.as_str()) {
            return Err(StoreError::LockNotHeld {
                table: PRODUCTS,
                key: product.id.to_string(),
            });
        }
        tx.writes.products.insert(product.id.clone(), product);
        Ok(())
    }
}

/// Coupon definitions. The coupon row lock is the serialization point
/// for usage-limit checks.
pub mod coupons {
    use super::*;
    use till_commerce::coupon::Coupon;
    use till_commerce::ids::CouponId;

    pub fn get(tx: &Tx<'_>, id: &CouponId) -> Option<Coupon> {
        if let Some(staged) = tx.writes.coupons.get(id) {
            return Some(staged.clone());
        }
        tx.tables().coupons.get(id).cloned()
    }

    /// Resolve a code to its coupon without locking.
    pub fn find_by_code(tx: &Tx<'_>, code: &str) -> Option<Coupon> {
        let code = code.to_uppercase();
        let id = tx
            .writes
            .coupon_code_claims
            .get(&code)
            .cloned()
            .or_else(|| tx.tables().coupon_codes.get(&code).cloned())?;
        get(tx, &id)
    }

    /// Lock the coupon row by id, then read it.
    pub fn get_for_update(tx: &mut Tx<'_>, id: &CouponId) -> Result<Coupon, StoreError> {
        tx.lock_row(COUPONS, id.as_str())?;
        get(tx, id).ok_or_else(|| StoreError::NotFound {
            table: COUPONS,
            key: id.to_string(),
        })
    }

    /// Lock the coupon row by code, then read it.
    pub fn lock_by_code(tx: &mut Tx<'_>, code: &str) -> Result<Coupon, StoreError> {
        let coupon = find_by_code(tx, code).ok_or_else(|| StoreError::NotFound {
            table: COUPONS,
            key: code.to_uppercase(),
        })?;
        tx.lock_row(COUPONS, coupon.id.as_str())?;
        // Re-read after the lock; another transaction may have committed
        // between the unlocked read and acquisition.
        get(tx, &coupon.id).ok_or_else(|| StoreError::NotFound {
            table: COUPONS,
            key: code.to_uppercase(),
        })
    }

    pub fn put(tx: &mut Tx<'_>, coupon: Coupon) -> Result<(), StoreError> {
        if !tx.holds(COUPONS, coupon.id.as_str()) {
            return Err(StoreError::LockNotHeld {
                table: COUPONS,
                key: coupon.id.to_string(),
            });
        }
        tx.writes
            .coupon_code_claims
            .insert(coupon.code.clone(), coupon.id.clone());
        tx.writes.coupons.insert(coupon.id.clone(), coupon);
        Ok(())
    }
}

/// Coupon usage rows: the source of truth for usage counting.
pub mod usages {
    use super::*;
    use crate::records::CouponUsage;
    use till_commerce::ids::{CouponId, OrderId, UserId};

    /// Count all redemptions of a coupon, cancelled ones included.
    pub fn count_for_coupon(tx: &Tx<'_>, coupon_id: &CouponId) -> i64 {
        let staged = tx
            .writes
            .usage_inserts
            .iter()
            .filter(|u| &u.coupon_id == coupon_id)
            .count();
        let committed = tx
            .tables()
            .usages
            .iter()
            .filter(|u| &u.coupon_id == coupon_id)
            .count();
        (staged + committed) as i64
    }

    /// Count one user's redemptions of a coupon.
    pub fn count_for_user(tx: &Tx<'_>, coupon_id: &CouponId, user_id: &UserId) -> i64 {
        let matches = |u: &CouponUsage| {
            &u.coupon_id == coupon_id && u.user_id.as_ref() == Some(user_id)
        };
        let staged = tx.writes.usage_inserts.iter().filter(|u| matches(u)).count();
        let committed = tx.tables().usages.iter().filter(|u| matches(u)).count();
        (staged + committed) as i64
    }

    pub fn find_by_order(tx: &Tx<'_>, order_id: &OrderId) -> Option<CouponUsage> {
        if let Some(staged) = tx
            .writes
            .usage_inserts
            .iter()
            .find(|u| &u.order_id == order_id)
        {
            return Some(staged.clone());
        }
        tx.tables()
            .usages
            .iter()
            .find(|u| &u.order_id == order_id)
            .cloned()
    }

    /// Insert a redemption. The coupon row lock must be held: the count
    /// check and this insert have to sit in the same serialized window.
    pub fn insert(tx: &mut Tx<'_>, usage: CouponUsage) -> Result<(), StoreError> {
        if !tx.holds(COUPONS, usage.coupon_id.as_str()) {
            return Err(StoreError::LockNotHeld {
                table: COUPONS,
                key: usage.coupon_id.to_string(),
            });
        }
        tx.writes.usage_inserts.push(usage);
        Ok(())
    }

    /// Tag a redemption as belonging to a cancelled order. The row
    /// stays in the count.
    pub fn mark_cancelled(tx: &mut Tx<'_>, mut usage: CouponUsage) -> Result<(), StoreError> {
        if !tx.holds(COUPONS, usage.coupon_id.as_str()) {
            return Err(StoreError::LockNotHeld {
                table: COUPONS,
                key: usage.coupon_id.to_string(),
            });
        }
        usage.cancelled = true;
        tx.writes.usage_updates.insert(usage.id.clone(), usage);
        Ok(())
    }
}

/// Orders and the order-number unique index.
pub mod orders {
    use super::*;
    use till_commerce::ids::{OrderId, UserId};
    use till_commerce::order::{Order, OrderStatus};

    pub fn get(tx: &Tx<'_>, id: &OrderId) -> Option<Order> {
        if let Some(staged) = tx.writes.orders.get(id) {
            return Some(staged.clone());
        }
        tx.tables().orders.get(id).cloned()
    }

    pub fn get_for_update(tx: &mut Tx<'_>, id: &OrderId) -> Result<Order, StoreError> {
        tx.lock_row(ORDERS, id.as_str())?;
        get(tx, id).ok_or_else(|| StoreError::NotFound {
            table: ORDERS,
            key: id.to_string(),
        })
    }

    /// Try to claim an order number for this transaction.
    ///
    /// Locks the number's index row, then checks availability. Returns
    /// `false` when another order already owns it; the caller generates
    /// a fresh candidate and tries again, bounded.
    pub fn claim_order_number(
        tx: &mut Tx<'_>,
        number: &str,
        order_id: &OrderId,
    ) -> Result<bool, StoreError> {
        tx.lock_row(ORDER_NUMBERS, number)?;
        let taken = tx.writes.order_number_claims.contains_key(number)
            || tx.tables().order_numbers.contains_key(number);
        if taken {
            return Ok(false);
        }
        tx.writes
            .order_number_claims
            .insert(number.to_string(), order_id.clone());
        Ok(true)
    }

    /// Insert a new order. Its number must have been claimed first.
    pub fn insert(tx: &mut Tx<'_>, order: Order) -> Result<(), StoreError> {
        if tx.writes.order_number_claims.get(&order.order_number) != Some(&order.id) {
            return Err(StoreError::LockNotHeld {
                table: ORDER_NUMBERS,
                key: order.order_number.clone(),
            });
        }
        tx.lock_row(ORDERS, order.id.as_str())?;
        if get(tx, &order.id).is_some() {
            return Err(StoreError::DuplicateKey {
                table: ORDERS,
                key: order.id.to_string(),
            });
        }
        tx.writes.orders.insert(order.id.clone(), order);
        Ok(())
    }

    pub fn put(tx: &mut Tx<'_>, order: Order) -> Result<(), StoreError> {
        if !tx.holds(ORDERS, order.id.as_str()) {
            return Err(StoreError::LockNotHeld {
                table: ORDERS,
                key: order.id.to_string(),
            });
        }
        tx.writes.orders.insert(order.id.clone(), order);
        Ok(())
    }

    /// Orders that count against "new customer" status: anything the
    /// user actually went through with.
    pub fn count_settled_for_user(tx: &Tx<'_>, user_id: &UserId) -> i64 {
        let counts = |o: &Order| {
            o.user_id.as_ref() == Some(user_id)
                && !matches!(
                    o.status,
                    OrderStatus::Cancelled | OrderStatus::PaymentFailed
                )
        };
        let staged = tx.writes.orders.values().filter(|o| counts(o)).count();
        let committed = tx
            .tables()
            .orders
            .values()
            .filter(|o| counts(o) && !tx.writes.orders.contains_key(&o.id))
            .count();
        (staged + committed) as i64
    }
}

/// Payment rows, unique on gateway intent id and on order.
pub mod payments {
    use super::*;
    use crate::records::Payment;
    use till_commerce::ids::{OrderId, PaymentId};

    pub fn get(tx: &Tx<'_>, id: &PaymentId) -> Option<Payment> {
        if let Some(staged) = tx.writes.payments.get(id) {
            return Some(staged.clone());
        }
        tx.tables().payments.get(id).cloned()
    }

    pub fn find_by_intent(tx: &Tx<'_>, intent_id: &str) -> Option<Payment> {
        let id = tx
            .writes
            .payment_intent_claims
            .get(intent_id)
            .cloned()
            .or_else(|| tx.tables().payment_intents.get(intent_id).cloned())?;
        get(tx, &id)
    }

    pub fn find_by_order(tx: &Tx<'_>, order_id: &OrderId) -> Option<Payment> {
        let id = tx
            .writes
            .payment_order_claims
            .get(order_id)
            .cloned()
            .or_else(|| tx.tables().payments_by_order.get(order_id).cloned())?;
        get(tx, &id)
    }

    pub fn get_for_update(tx: &mut Tx<'_>, id: &PaymentId) -> Result<Payment, StoreError> {
        tx.lock_row(PAYMENTS, id.as_str())?;
        get(tx, id).ok_or_else(|| StoreError::NotFound {
            table: PAYMENTS,
            key: id.to_string(),
        })
    }

    /// Lock the payment behind an intent id, then read it.
    pub fn find_by_intent_for_update(
        tx: &mut Tx<'_>,
        intent_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let Some(payment) = find_by_intent(tx, intent_id) else {
            return Ok(None);
        };
        tx.lock_row(PAYMENTS, payment.id.as_str())?;
        Ok(find_by_intent(tx, intent_id))
    }

    /// Insert a payment, enforcing intent-id and order uniqueness.
    pub fn insert(tx: &mut Tx<'_>, payment: Payment) -> Result<(), StoreError> {
        tx.lock_row(PAYMENT_INTENTS, &payment.intent_id)?;
        if find_by_intent(tx, &payment.intent_id).is_some() {
            return Err(StoreError::DuplicateKey {
                table: PAYMENT_INTENTS,
                key: payment.intent_id.clone(),
            });
        }
        if find_by_order(tx, &payment.order_id).is_some() {
            return Err(StoreError::DuplicateKey {
                table: PAYMENTS,
                key: payment.order_id.to_string(),
            });
        }
        tx.lock_row(PAYMENTS, payment.id.as_str())?;
        tx.writes
            .payment_intent_claims
            .insert(payment.intent_id.clone(), payment.id.clone());
        tx.writes
            .payment_order_claims
            .insert(payment.order_id.clone(), payment.id.clone());
        tx.writes.payments.insert(payment.id.clone(), payment);
        Ok(())
    }

    pub fn put(tx: &mut Tx<'_>, payment: Payment) -> Result<(), StoreError> {
        if !tx.holds(PAYMENTS, payment.id.as_str()) {
            return Err(StoreError::LockNotHeld {
                table: PAYMENTS,
                key: payment.id.to_string(),
            });
        }
        tx.writes.payments.insert(payment.id.clone(), payment);
        Ok(())
    }
}

/// The append-only stock-movement log.
pub mod movements {
    use super::*;
    use crate::records::{InventoryMovement, MovementKind};
    use till_commerce::ids::{OrderId, ProductId};

    /// Append a movement. The product row lock must be held so the
    /// movement and the counter write land in the same serialized
    /// window.
    pub fn append(tx: &mut Tx<'_>, movement: InventoryMovement) -> Result<(), StoreError> {
        if !tx.holds(PRODUCTS, movement.product_id.as_str()) {
            return Err(StoreError::LockNotHeld {
                table: PRODUCTS,
                key: movement.product_id.to_string(),
            });
        }
        tx.writes.movement_appends.push(movement);
        Ok(())
    }

    pub fn for_product(tx: &Tx<'_>, product_id: &ProductId) -> Vec<InventoryMovement> {
        let mut all: Vec<InventoryMovement> = tx
            .tables()
            .movements
            .get(product_id)
            .cloned()
            .unwrap_or_default();
        all.extend(
            tx.writes
                .movement_appends
                .iter()
                .filter(|m| &m.product_id == product_id)
                .cloned(),
        );
        all
    }

    /// Units still reserved by `order_id` against `product_id`:
    /// reserves minus releases. Floor for release clamping.
    pub fn net_reserved(tx: &Tx<'_>, order_id: &OrderId, product_id: &ProductId) -> i64 {
        for_product(tx, product_id)
            .iter()
            .filter(|m| m.order_id.as_ref() == Some(order_id))
            .map(|m| match m.kind {
                MovementKind::Reserve => m.quantity,
                MovementKind::Release => -m.quantity,
                _ => 0,
            })
            .sum()
    }
}

/// Stock alerts, deduped to one open alert per (product, kind).
pub mod alerts {
    use super::*;
    use crate::records::{AlertKind, StockAlert};
    use till_commerce::ids::ProductId;

    const ALERTS: &str = "alerts";

    fn slot_key(product_id: &ProductId, kind: AlertKind) -> String {
        format!("{}:{}", product_id, kind.as_str())
    }

    pub fn open_for(tx: &Tx<'_>, product_id: &ProductId, kind: AlertKind) -> Option<StockAlert> {
        let slot = (product_id.clone(), kind);
        if let Some(update) = tx.writes.open_alert_updates.get(&slot) {
            return update.as_ref().and_then(|id| {
                tx.writes
                    .alerts
                    .get(id)
                    .cloned()
                    .or_else(|| tx.tables().alerts.get(id).cloned())
            });
        }
        let tables = tx.tables();
        tables
            .open_alerts
            .get(&slot)
            .and_then(|id| tables.alerts.get(id).cloned())
    }

    /// Open an alert unless one is already open for the slot. The slot
    /// is locked so two concurrent crossings stage exactly one alert.
    /// Returns whether a new alert was staged.
    pub fn open(tx: &mut Tx<'_>, alert: StockAlert) -> Result<bool, StoreError> {
        tx.lock_row(ALERTS, &slot_key(&alert.product_id, alert.kind))?;
        if open_for(tx, &alert.product_id, alert.kind).is_some() {
            return Ok(false);
        }
        let slot = (alert.product_id.clone(), alert.kind);
        tx.writes
            .open_alert_updates
            .insert(slot, Some(alert.id.clone()));
        tx.writes.alerts.insert(alert.id.clone(), alert);
        Ok(true)
    }

    /// Resolve the open alert for a slot, if any.
    pub fn resolve(
        tx: &mut Tx<'_>,
        product_id: &ProductId,
        kind: AlertKind,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<StockAlert>, StoreError> {
        tx.lock_row(ALERTS, &slot_key(product_id, kind))?;
        let Some(mut alert) = open_for(tx, product_id, kind) else {
            return Ok(None);
        };
        alert.open = false;
        alert.resolved_at = Some(now);
        tx.writes
            .open_alert_updates
            .insert((product_id.clone(), kind), None);
        tx.writes.alerts.insert(alert.id.clone(), alert.clone());
        Ok(Some(alert))
    }
}
