//! Cart persistence.
//!
//! One interface, two backends: guest carts live in an ephemeral
//! session-keyed store with a TTL, signed-in carts in a persistent
//! user-keyed store. The backend is chosen from the explicit
//! [`CartOwner`] on the cart, never from ambient session state.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use till_commerce::cart::{Cart, CartOwner};
use till_commerce::clock::Clock;
use till_commerce::ids::UserId;

/// Cart persistence seam.
pub trait CartStore: Send + Sync {
    /// Load the owner's cart, if one exists (and has not expired).
    fn load(&self, owner: &CartOwner) -> Option<Cart>;
    /// Persist the cart under its owner key.
    fn save(&self, cart: &Cart);
    /// Drop the owner's cart. Used on checkout success and explicit
    /// clears.
    fn clear(&self, owner: &CartOwner);
}

struct SessionEntry {
    cart: Cart,
    touched_at: DateTime<Utc>,
}

/// Ephemeral session-keyed cart store with a sliding TTL.
pub struct SessionCartStore {
    entries: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionCartStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    fn session_key(owner: &CartOwner) -> Option<&str> {
        match owner {
            CartOwner::Session(token) => Some(token),
            CartOwner::User(_) => None,
        }
    }

    /// Drop every expired entry. Called opportunistically on writes.
    fn sweep(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.write().expect("cart store poisoned");
        let ttl = self.ttl;
        entries.retain(|_, e| now - e.touched_at <= ttl);
    }
}

impl CartStore for SessionCartStore {
    fn load(&self, owner: &CartOwner) -> Option<Cart> {
        let key = Self::session_key(owner)?;
        let now = self.clock.now();
        let entries = self.entries.read().expect("cart store poisoned");
        let entry = entries.get(key)?;
        if now - entry.touched_at > self.ttl {
            return None;
        }
        Some(entry.cart.clone())
    }

    fn save(&self, cart: &Cart) {
        let Some(key) = Self::session_key(&cart.owner) else {
            return;
        };
        let now = self.clock.now();
        self.sweep(now);
        let mut entries = self.entries.write().expect("cart store poisoned");
        entries.insert(
            key.to_string(),
            SessionEntry {
                cart: cart.clone(),
                touched_at: now,
            },
        );
    }

    fn clear(&self, owner: &CartOwner) {
        if let Some(key) = Self::session_key(owner) {
            let mut entries = self.entries.write().expect("cart store poisoned");
            entries.remove(key);
        }
    }
}

/// Persistent user-keyed cart store.
pub struct UserCartStore {
    entries: RwLock<HashMap<UserId, Cart>>,
}

impl UserCartStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for UserCartStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CartStore for UserCartStore {
    fn load(&self, owner: &CartOwner) -> Option<Cart> {
        let user_id = owner.user_id()?;
        let entries = self.entries.read().expect("cart store poisoned");
        entries.get(user_id).cloned()
    }

    fn save(&self, cart: &Cart) {
        if let Some(user_id) = cart.owner.user_id() {
            let mut entries = self.entries.write().expect("cart store poisoned");
            entries.insert(user_id.clone(), cart.clone());
        }
    }

    fn clear(&self, owner: &CartOwner) {
        if let Some(user_id) = owner.user_id() {
            let mut entries = self.entries.write().expect("cart store poisoned");
            entries.remove(user_id);
        }
    }
}

/// Routes each operation to the backend matching the cart's owner.
pub struct RoutingCartStore {
    sessions: SessionCartStore,
    users: UserCartStore,
}

impl RoutingCartStore {
    pub fn new(session_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: SessionCartStore::new(session_ttl, clock),
            users: UserCartStore::new(),
        }
    }

    fn backend(&self, owner: &CartOwner) -> &dyn CartStore {
        match owner {
            CartOwner::Session(_) => &self.sessions,
            CartOwner::User(_) => &self.users,
        }
    }
}

impl CartStore for RoutingCartStore {
    fn load(&self, owner: &CartOwner) -> Option<Cart> {
        self.backend(owner).load(owner)
    }

    fn save(&self, cart: &Cart) {
        self.backend(&cart.owner).save(cart)
    }

    fn clear(&self, owner: &CartOwner) {
        self.backend(owner).clear(owner)
    }
}
