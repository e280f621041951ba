//! Transactional in-memory storage for Till.
//!
//! The pipeline's consistency guarantees rest on this crate:
//!
//! - **Row locks**: per-row exclusive locks serialize the
//!   read-check-write cycles that keep stock and coupon limits honest
//!   under concurrent checkouts.
//! - **Transactions**: writes are staged and applied atomically at
//!   commit; an aborted transaction leaves nothing behind.
//! - **Repositories**: explicit functions over an explicit transaction
//!   handle. No ambient connection, no implicit query scope.
//!
//! Storage is process-local. The repository seam is shaped so a SQL
//! backend can slot in behind the same functions.

pub mod cart_store;
pub mod error;
mod kernel;
pub mod records;
pub mod repos;
mod store;

pub use cart_store::{CartStore, RoutingCartStore, SessionCartStore, UserCartStore};
pub use error::StoreError;
pub use records::{
    AlertKind, CouponUsage, InventoryMovement, MovementKind, Payment, StockAlert,
};
pub use store::{Store, StoreCatalog, StoreConfig, Tx};
