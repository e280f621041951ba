//! The store: tables, transactions, atomic commit.

use crate::error::StoreError;
use crate::kernel::{LockManager, RowKey, TxId};
use crate::records::{AlertKind, CouponUsage, InventoryMovement, Payment, StockAlert};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use till_commerce::catalog::{ProductCatalog, ProductSnapshot};
use till_commerce::coupon::Coupon;
use till_commerce::ids::{AlertId, CouponId, OrderId, PaymentId, ProductId, UsageId};
use till_commerce::order::Order;

/// Storage tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long a transaction waits for a contended row lock before the
    /// whole operation is aborted as a concurrency conflict.
    #[serde(with = "humantime_millis")]
    pub lock_wait: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(5),
        }
    }
}

/// Serialize durations as integer milliseconds.
mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Committed state.
#[derive(Default)]
pub(crate) struct Tables {
    pub products: HashMap<ProductId, ProductSnapshot>,
    pub coupons: HashMap<CouponId, Coupon>,
    pub coupon_codes: HashMap<String, CouponId>,
    pub usages: Vec<CouponUsage>,
    pub orders: HashMap<OrderId, Order>,
    pub order_numbers: HashMap<String, OrderId>,
    pub payments: HashMap<PaymentId, Payment>,
    pub payment_intents: HashMap<String, PaymentId>,
    pub payments_by_order: HashMap<OrderId, PaymentId>,
    pub movements: HashMap<ProductId, Vec<InventoryMovement>>,
    pub alerts: HashMap<AlertId, StockAlert>,
    pub open_alerts: HashMap<(ProductId, AlertKind), AlertId>,
}

/// Writes staged by one transaction, applied wholesale at commit.
#[derive(Default)]
pub(crate) struct WriteSet {
    pub products: HashMap<ProductId, ProductSnapshot>,
    pub coupons: HashMap<CouponId, Coupon>,
    pub coupon_code_claims: HashMap<String, CouponId>,
    pub usage_inserts: Vec<CouponUsage>,
    pub usage_updates: HashMap<UsageId, CouponUsage>,
    pub orders: HashMap<OrderId, Order>,
    pub order_number_claims: HashMap<String, OrderId>,
    pub payments: HashMap<PaymentId, Payment>,
    pub payment_intent_claims: HashMap<String, PaymentId>,
    pub payment_order_claims: HashMap<OrderId, PaymentId>,
    pub movement_appends: Vec<InventoryMovement>,
    pub alerts: HashMap<AlertId, StockAlert>,
    /// `Some(id)` opens, `None` clears the open-alert slot.
    pub open_alert_updates: HashMap<(ProductId, AlertKind), Option<AlertId>>,
}

pub(crate) struct StoreInner {
    pub config: StoreConfig,
    pub locks: LockManager,
    pub tables: RwLock<Tables>,
    next_tx: AtomicU64,
}

/// Handle to the storage. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                locks: LockManager::default(),
                tables: RwLock::new(Tables::default()),
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    /// Begin a transaction. Dropping the handle without committing
    /// discards every staged write and releases every held lock.
    pub fn begin(&self) -> Tx<'_> {
        Tx {
            store: self.inner.as_ref(),
            id: TxId(self.inner.next_tx.fetch_add(1, Ordering::Relaxed)),
            writes: WriteSet::default(),
            finished: false,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.inner.tables.read().expect("store poisoned");
        f(&tables)
    }

    // Committed-only reads for callers outside a transaction.

    pub fn product(&self, id: &ProductId) -> Option<ProductSnapshot> {
        self.read(|t| t.products.get(id).cloned())
    }

    pub fn order(&self, id: &OrderId) -> Option<Order> {
        self.read(|t| t.orders.get(id).cloned())
    }

    pub fn order_by_number(&self, number: &str) -> Option<Order> {
        self.read(|t| {
            t.order_numbers
                .get(number)
                .and_then(|id| t.orders.get(id))
                .cloned()
        })
    }

    pub fn payment(&self, id: &PaymentId) -> Option<Payment> {
        self.read(|t| t.payments.get(id).cloned())
    }

    pub fn payment_by_intent(&self, intent_id: &str) -> Option<Payment> {
        self.read(|t| {
            t.payment_intents
                .get(intent_id)
                .and_then(|id| t.payments.get(id))
                .cloned()
        })
    }

    pub fn payment_for_order(&self, order_id: &OrderId) -> Option<Payment> {
        self.read(|t| {
            t.payments_by_order
                .get(order_id)
                .and_then(|id| t.payments.get(id))
                .cloned()
        })
    }

    pub fn coupon_by_code(&self, code: &str) -> Option<Coupon> {
        let code = code.to_uppercase();
        self.read(|t| {
            t.coupon_codes
                .get(&code)
                .and_then(|id| t.coupons.get(id))
                .cloned()
        })
    }

    pub fn movements_for(&self, product_id: &ProductId) -> Vec<InventoryMovement> {
        self.read(|t| t.movements.get(product_id).cloned().unwrap_or_default())
    }

    pub fn usages_for(&self, coupon_id: &CouponId) -> Vec<CouponUsage> {
        self.read(|t| {
            t.usages
                .iter()
                .filter(|u| &u.coupon_id == coupon_id)
                .cloned()
                .collect()
        })
    }

    pub fn open_alert(&self, product_id: &ProductId, kind: AlertKind) -> Option<StockAlert> {
        self.read(|t| {
            t.open_alerts
                .get(&(product_id.clone(), kind))
                .and_then(|id| t.alerts.get(id))
                .cloned()
        })
    }

    pub fn open_alerts(&self) -> Vec<StockAlert> {
        self.read(|t| t.alerts.values().filter(|a| a.open).cloned().collect())
    }

    /// Seed or replace a product snapshot. The catalog owns products;
    /// stock afterwards moves only through the inventory ledger.
    pub fn put_product(&self, product: ProductSnapshot) {
        let mut tables = self.inner.tables.write().expect("store poisoned");
        tables.products.insert(product.id.clone(), product);
    }

    /// Insert a coupon, enforcing write-time validation and code
    /// uniqueness.
    pub fn put_coupon(&self, coupon: Coupon) -> Result<(), StoreError> {
        coupon
            .validate()
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        let mut tables = self.inner.tables.write().expect("store poisoned");
        if let Some(existing) = tables.coupon_codes.get(&coupon.code) {
            if existing != &coupon.id {
                return Err(StoreError::DuplicateKey {
                    table: "coupons",
                    key: coupon.code,
                });
            }
        }
        tables
            .coupon_codes
            .insert(coupon.code.clone(), coupon.id.clone());
        tables.coupons.insert(coupon.id.clone(), coupon);
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// `ProductCatalog` view over committed products.
#[derive(Clone)]
pub struct StoreCatalog {
    store: Store,
}

impl StoreCatalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl ProductCatalog for StoreCatalog {
    fn product(&self, id: &ProductId) -> Option<ProductSnapshot> {
        self.store.product(id)
    }
}

/// An open transaction.
///
/// Reads see committed state overlaid with this transaction's own
/// staged writes. Row locks taken through repository functions are held
/// until `commit` or abort.
pub struct Tx<'s> {
    pub(crate) store: &'s StoreInner,
    pub(crate) id: TxId,
    pub(crate) writes: WriteSet,
    finished: bool,
}

impl Tx<'_> {
    /// Take (or re-take) the exclusive lock on one row.
    pub(crate) fn lock_row(&self, table: &'static str, key: &str) -> Result<(), StoreError> {
        self.store
            .locks
            .acquire(self.id, RowKey::new(table, key), self.store.config.lock_wait)
    }

    pub(crate) fn holds(&self, table: &'static str, key: &str) -> bool {
        self.store.locks.holds(self.id, &RowKey::new(table, key))
    }

    pub(crate) fn tables(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.store.tables.read().expect("store poisoned")
    }

    /// Apply every staged write atomically, then release locks.
    pub fn commit(mut self) -> Result<(), StoreError> {
        {
            let mut tables = self
                .store
                .tables
                .write()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let writes = std::mem::take(&mut self.writes);

            for (id, product) in writes.products {
                tables.products.insert(id, product);
            }
            for (id, coupon) in writes.coupons {
                tables.coupons.insert(id, coupon);
            }
            for (code, id) in writes.coupon_code_claims {
                tables.coupon_codes.insert(code, id);
            }
            for usage in writes.usage_inserts {
                tables.usages.push(usage);
            }
            for (id, updated) in writes.usage_updates {
                if let Some(usage) = tables.usages.iter_mut().find(|u| u.id == id) {
                    *usage = updated;
                }
            }
            for (number, id) in writes.order_number_claims {
                tables.order_numbers.insert(number, id);
            }
            for (id, order) in writes.orders {
                tables.orders.insert(id, order);
            }
            for (intent, id) in writes.payment_intent_claims {
                tables.payment_intents.insert(intent, id);
            }
            for (order_id, id) in writes.payment_order_claims {
                tables.payments_by_order.insert(order_id, id);
            }
            for (id, payment) in writes.payments {
                tables.payments.insert(id, payment);
            }
            for movement in writes.movement_appends {
                tables
                    .movements
                    .entry(movement.product_id.clone())
                    .or_default()
                    .push(movement);
            }
            for (id, alert) in writes.alerts {
                tables.alerts.insert(id, alert);
            }
            for (slot, value) in writes.open_alert_updates {
                match value {
                    Some(id) => {
                        tables.open_alerts.insert(slot, id);
                    }
                    None => {
                        tables.open_alerts.remove(&slot);
                    }
                }
            }
        }
        self.finished = true;
        self.store.locks.release_all(self.id);
        tracing::trace!(tx = self.id.0, "transaction committed");
        Ok(())
    }

    /// Discard every staged write and release locks.
    pub fn rollback(mut self) {
        self.finished = true;
        self.writes = WriteSet::default();
        self.store.locks.release_all(self.id);
        tracing::trace!(tx = self.id.0, "transaction rolled back");
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.locks.release_all(self.id);
            tracing::trace!(tx = self.id.0, "transaction dropped without commit");
        }
    }
}
