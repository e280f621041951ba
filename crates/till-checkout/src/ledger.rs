//! The inventory ledger.
//!
//! Append-only movement log plus the per-product stock counter. Every
//! mutation runs under the product's row lock inside the caller's
//! transaction, so a concurrent pair of checkouts contending for the
//! last unit cannot both pass the stock check.
//!
//! Alerting and back-in-stock fan-out run *after* commit, in their own
//! transaction: notification failures must never unwind an order.

use crate::error::CheckoutError;
use crate::notify::{NotificationDispatcher, NotificationEvent};
use std::sync::Arc;
use till_commerce::clock::Clock;
use till_commerce::error::CommerceError;
use till_commerce::ids::{OrderId, ProductId};
use till_store::repos::{alerts, movements, products};
use till_store::{AlertKind, InventoryMovement, MovementKind, StockAlert, Store, Tx};

/// Atomic reserve/release/adjust over product stock.
#[derive(Clone)]
pub struct InventoryLedger {
    low_stock_threshold: i64,
    clock: Arc<dyn Clock>,
}

impl InventoryLedger {
    pub fn new(low_stock_threshold: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            low_stock_threshold,
            clock,
        }
    }

    /// Reserve `qty` units against an order.
    ///
    /// Read, check and write happen under the product row lock; a
    /// failed check aborts with the available quantity and stages
    /// nothing.
    pub fn reserve(
        &self,
        tx: &mut Tx<'_>,
        product_id: &ProductId,
        qty: i64,
        order_id: &OrderId,
    ) -> Result<InventoryMovement, CheckoutError> {
        if qty <= 0 {
            return Err(CommerceError::InvalidQuantity(qty).into());
        }
        let mut product = products::get_for_update(tx, product_id)?;
        if product.stock_quantity < qty {
            return Err(CheckoutError::InsufficientStock {
                product_id: product_id.clone(),
                requested: qty,
                available: product.stock_quantity,
            });
        }
        let old = product.stock_quantity;
        product.stock_quantity = old - qty;
        product.updated_at = self.clock.now();
        products::put(tx, product)?;

        let movement = InventoryMovement::record(
            product_id.clone(),
            MovementKind::Reserve,
            qty,
            old,
            old - qty,
            "checkout reservation",
            Some(order_id.clone()),
            self.clock.now(),
        );
        movements::append(tx, movement.clone())?;
        Ok(movement)
    }

    /// Return reserved units to stock.
    ///
    /// Clamped to the order's outstanding reservation for the product:
    /// a duplicated release (late webhook after a cancel) can never
    /// push stock above what the ledger accounts for. Returns `None`
    /// when there was nothing left to release.
    pub fn release(
        &self,
        tx: &mut Tx<'_>,
        product_id: &ProductId,
        qty: i64,
        order_id: &OrderId,
    ) -> Result<Option<InventoryMovement>, CheckoutError> {
        if qty <= 0 {
            return Err(CommerceError::InvalidQuantity(qty).into());
        }
        let mut product = products::get_for_update(tx, product_id)?;
        let outstanding = movements::net_reserved(tx, order_id, product_id);
        let clamped = qty.min(outstanding);
        if clamped <= 0 {
            tracing::debug!(%product_id, %order_id, "release with no outstanding reservation");
            return Ok(None);
        }

        let old = product.stock_quantity;
        product.stock_quantity = old + clamped;
        product.updated_at = self.clock.now();
        products::put(tx, product)?;

        let movement = InventoryMovement::record(
            product_id.clone(),
            MovementKind::Release,
            clamped,
            old,
            old + clamped,
            "reservation released",
            Some(order_id.clone()),
            self.clock.now(),
        );
        movements::append(tx, movement.clone())?;
        Ok(Some(movement))
    }

    /// Admin direct set of the stock counter.
    pub fn adjust(
        &self,
        tx: &mut Tx<'_>,
        product_id: &ProductId,
        new_qty: i64,
        reason: &str,
    ) -> Result<InventoryMovement, CheckoutError> {
        if new_qty < 0 {
            return Err(CommerceError::InvalidQuantity(new_qty).into());
        }
        let mut product = products::get_for_update(tx, product_id)?;
        let old = product.stock_quantity;
        product.stock_quantity = new_qty;
        product.updated_at = self.clock.now();
        products::put(tx, product)?;

        let movement = InventoryMovement::record(
            product_id.clone(),
            MovementKind::Adjust,
            (new_qty - old).abs(),
            old,
            new_qty,
            reason,
            None,
            self.clock.now(),
        );
        movements::append(tx, movement.clone())?;
        Ok(movement)
    }

    /// Inbound stock.
    pub fn restock(
        &self,
        tx: &mut Tx<'_>,
        product_id: &ProductId,
        qty: i64,
        reason: &str,
    ) -> Result<InventoryMovement, CheckoutError> {
        if qty <= 0 {
            return Err(CommerceError::InvalidQuantity(qty).into());
        }
        let mut product = products::get_for_update(tx, product_id)?;
        let old = product.stock_quantity;
        product.stock_quantity = old + qty;
        product.updated_at = self.clock.now();
        products::put(tx, product)?;

        let movement = InventoryMovement::record(
            product_id.clone(),
            MovementKind::Restock,
            qty,
            old,
            old + qty,
            reason,
            None,
            self.clock.now(),
        );
        movements::append(tx, movement.clone())?;
        Ok(movement)
    }

    /// Audit: the movement log must chain (each entry starts where the
    /// previous ended) and land exactly on the current counter.
    pub fn verify(&self, store: &Store, product_id: &ProductId) -> bool {
        let Some(product) = store.product(product_id) else {
            return false;
        };
        let log = store.movements_for(product_id);
        let mut expected_prev: Option<i64> = None;
        for movement in &log {
            if movement.new_stock < 0 {
                return false;
            }
            if movement.new_stock - movement.old_stock != movement.signed_delta() {
                return false;
            }
            if let Some(prev) = expected_prev {
                if movement.old_stock != prev {
                    return false;
                }
            }
            expected_prev = Some(movement.new_stock);
        }
        match expected_prev {
            Some(last) => last == product.stock_quantity,
            None => true,
        }
    }

    /// Post-commit side effects for a batch of movements: stock alerts
    /// (deduped to one open alert per product and kind) and
    /// notification fan-out. Never fails the caller.
    pub fn publish_stock_events(
        &self,
        store: &Store,
        batch: &[InventoryMovement],
        dispatcher: &dyn NotificationDispatcher,
    ) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.apply_stock_events(store, batch, dispatcher) {
            tracing::error!(error = %e, "failed to persist stock alerts");
        }
    }

    fn apply_stock_events(
        &self,
        store: &Store,
        batch: &[InventoryMovement],
        dispatcher: &dyn NotificationDispatcher,
    ) -> Result<(), CheckoutError> {
        let now = self.clock.now();
        let mut tx = store.begin();
        let mut events = Vec::new();

        for movement in batch {
            let (old, new) = (movement.old_stock, movement.new_stock);
            let product_id = &movement.product_id;

            if new == 0 && old > 0 {
                let opened = alerts::open(
                    &mut tx,
                    StockAlert::open_now(product_id.clone(), AlertKind::OutOfStock, new, now),
                )?;
                if opened {
                    events.push(NotificationEvent::OutOfStock {
                        product_id: product_id.clone(),
                    });
                }
            } else if old == 0 && new > 0 {
                if alerts::resolve(&mut tx, product_id, AlertKind::OutOfStock, now)?.is_some() {
                    events.push(NotificationEvent::BackInStock {
                        product_id: product_id.clone(),
                        stock: new,
                    });
                }
            }

            if new > 0 && new <= self.low_stock_threshold && old > self.low_stock_threshold {
                let opened = alerts::open(
                    &mut tx,
                    StockAlert::open_now(product_id.clone(), AlertKind::LowStock, new, now),
                )?;
                if opened {
                    events.push(NotificationEvent::LowStock {
                        product_id: product_id.clone(),
                        stock: new,
                    });
                }
            } else if new > self.low_stock_threshold && old <= self.low_stock_threshold {
                alerts::resolve(&mut tx, product_id, AlertKind::LowStock, now)?;
            }
        }

        tx.commit()?;
        for event in events {
            dispatcher.notify(event);
        }
        Ok(())
    }
}
