//! Row-level lock manager.
//!
//! Transactions take exclusive per-row locks before read-check-write
//! cycles and hold them until commit or abort. Waiters block with a
//! bounded timeout; a timeout aborts the waiting transaction, never the
//! holder. Callers avoid deadlock by acquiring in sorted key order; the
//! timeout is the backstop.

use crate::error::StoreError;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Transaction identifier, unique per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TxId(pub u64);

/// Identifies one lockable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RowKey {
    pub table: &'static str,
    pub key: String,
}

impl RowKey {
    pub fn new(table: &'static str, key: impl Into<String>) -> Self {
        Self {
            table,
            key: key.into(),
        }
    }
}

#[derive(Default)]
pub(crate) struct LockManager {
    held: Mutex<HashMap<RowKey, TxId>>,
    released: Condvar,
}

impl LockManager {
    /// Acquire `key` for `tx`, waiting up to `wait`.
    ///
    /// Re-acquiring a lock the transaction already holds is a no-op.
    pub fn acquire(&self, tx: TxId, key: RowKey, wait: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + wait;
        let mut held = self
            .held
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        loop {
            match held.get(&key).copied() {
                None => {
                    held.insert(key, tx);
                    return Ok(());
                }
                Some(owner) if owner == tx => return Ok(()),
                Some(_) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(StoreError::LockTimeout {
                            table: key.table,
                            key: key.key,
                        });
                    }
                    let (guard, timeout) = self
                        .released
                        .wait_timeout(held, remaining)
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                    held = guard;
                    if timeout.timed_out() && held.get(&key).is_some_and(|o| *o != tx) {
                        return Err(StoreError::LockTimeout {
                            table: key.table,
                            key: key.key,
                        });
                    }
                }
            }
        }
    }

    /// Whether `tx` currently holds `key`.
    pub fn holds(&self, tx: TxId, key: &RowKey) -> bool {
        self.held
            .lock()
            .map(|held| held.get(key).is_some_and(|o| *o == tx))
            .unwrap_or(false)
    }

    /// Release every lock held by `tx` and wake waiters.
    pub fn release_all(&self, tx: TxId) {
        if let Ok(mut held) = self.held.lock() {
            held.retain(|_, owner| *owner != tx);
        }
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_and_reacquire() {
        let locks = LockManager::default();
        let key = RowKey::new("products", "prd_a");
        locks
            .acquire(TxId(1), key.clone(), Duration::from_millis(10))
            .unwrap();
        // Reentrant for the same transaction.
        locks
            .acquire(TxId(1), key.clone(), Duration::from_millis(10))
            .unwrap();
        assert!(locks.holds(TxId(1), &key));
    }

    #[test]
    fn test_contention_times_out() {
        let locks = LockManager::default();
        let key = RowKey::new("products", "prd_a");
        locks
            .acquire(TxId(1), key.clone(), Duration::from_millis(10))
            .unwrap();
        let err = locks
            .acquire(TxId(2), key, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let locks = Arc::new(LockManager::default());
        let key = RowKey::new("products", "prd_a");
        locks
            .acquire(TxId(1), key.clone(), Duration::from_millis(10))
            .unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            std::thread::spawn(move || locks.acquire(TxId(2), key, Duration::from_secs(2)))
        };

        std::thread::sleep(Duration::from_millis(30));
        locks.release_all(TxId(1));
        waiter.join().unwrap().unwrap();
        assert!(locks.holds(TxId(2), &key));
    }

    #[test]
    fn test_release_all_only_drops_own_locks() {
        let locks = LockManager::default();
        let a = RowKey::new("products", "prd_a");
        let b = RowKey::new("products", "prd_b");
        locks
            .acquire(TxId(1), a.clone(), Duration::from_millis(10))
            .unwrap();
        locks
            .acquire(TxId(2), b.clone(), Duration::from_millis(10))
            .unwrap();
        locks.release_all(TxId(1));
        assert!(!locks.holds(TxId(1), &a));
        assert!(locks.holds(TxId(2), &b));
    }
}
