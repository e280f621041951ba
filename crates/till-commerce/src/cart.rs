//! Cart, cart lines and the identity that owns them.

use crate::error::CommerceError;
use crate::ids::{CartId, ProductId, UserId};
use crate::money::{Currency, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum quantity allowed per cart line.
pub const MAX_QUANTITY_PER_LINE: i64 = 999;

/// Who a cart belongs to.
///
/// Guest carts are keyed by session, signed-in carts by user. The
/// distinction is explicit here instead of living in ambient session
/// state; stores pick their backend from this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CartOwner {
    /// Anonymous cart keyed by a session token.
    Session(String),
    /// Cart persisted against a user account.
    User(UserId),
}

impl CartOwner {
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            CartOwner::Session(_) => None,
            CartOwner::User(id) => Some(id),
        }
    }
}

/// One product in a cart, with the price captured when it was added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartLine {
    /// The product.
    pub product_id: ProductId,
    /// Product name at add time.
    pub name: String,
    /// Units requested. Always >= 1.
    pub quantity: i64,
    /// Unit price captured when the line was added. The validator warns
    /// when this drifts from the live price.
    pub unit_price: Money,
    /// Selected options (size, color, ...).
    pub options: BTreeMap<String, String>,
}

impl CartLine {
    pub fn new(
        product_id: ProductId,
        name: impl Into<String>,
        quantity: i64,
        unit_price: Money,
    ) -> Result<Self, CommerceError> {
        if quantity < 1 {
            return Err(CommerceError::InvalidQuantity(quantity));
        }
        if quantity > MAX_QUANTITY_PER_LINE {
            return Err(CommerceError::QuantityExceedsLimit(
                quantity,
                MAX_QUANTITY_PER_LINE,
            ));
        }
        Ok(Self {
            product_id,
            name: name.into(),
            quantity,
            unit_price,
            options: BTreeMap::new(),
        })
    }

    /// Quantity times captured unit price.
    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// A mutable cart. Destroyed on checkout success or explicit clear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cart {
    pub id: CartId,
    pub owner: CartOwner,
    pub lines: Vec<CartLine>,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(owner: CartOwner, currency: Currency, now: DateTime<Utc>) -> Self {
        Self {
            id: CartId::generate(),
            owner,
            lines: Vec::new(),
            currency,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a line, merging into an existing line for the same product
    /// and option set.
    pub fn add_line(&mut self, line: CartLine, now: DateTime<Utc>) -> Result<(), CommerceError> {
        if let Some(existing) = self
            .lines
            .iter_mut()
            .find(|l| l.product_id == line.product_id && l.options == line.options)
        {
            let merged = existing
                .quantity
                .checked_add(line.quantity)
                .ok_or(CommerceError::Overflow)?;
            if merged > MAX_QUANTITY_PER_LINE {
                return Err(CommerceError::QuantityExceedsLimit(
                    merged,
                    MAX_QUANTITY_PER_LINE,
                ));
            }
            existing.quantity = merged;
        } else {
            self.lines.push(line);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Set a line's quantity; zero or less removes the line.
    pub fn update_quantity(
        &mut self,
        product_id: &ProductId,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<(), CommerceError> {
        if quantity <= 0 {
            return self.remove_line(product_id, now);
        }
        if quantity > MAX_QUANTITY_PER_LINE {
            return Err(CommerceError::QuantityExceedsLimit(
                quantity,
                MAX_QUANTITY_PER_LINE,
            ));
        }
        let line = self
            .lines
            .iter_mut()
            .find(|l| &l.product_id == product_id)
            .ok_or_else(|| CommerceError::LineNotInCart(product_id.to_string()))?;
        line.quantity = quantity;
        self.updated_at = now;
        Ok(())
    }

    pub fn remove_line(
        &mut self,
        product_id: &ProductId,
        now: DateTime<Utc>,
    ) -> Result<(), CommerceError> {
        let before = self.lines.len();
        self.lines.retain(|l| &l.product_id != product_id);
        if self.lines.len() == before {
            return Err(CommerceError::LineNotInCart(product_id.to_string()));
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.lines.clear();
        self.updated_at = now;
    }

    /// Sum of line totals at captured prices.
    pub fn subtotal(&self) -> Money {
        self.lines
            .iter()
            .fold(Money::zero(self.currency), |acc, l| acc + l.line_total())
    }

    /// Total units across all lines.
    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// A postal address, stored as given.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Address {
    pub name: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub region: Option<String>,
    pub postal_code: String,
    pub country: String,
}

impl Address {
    /// Whether the fields checkout requires are present.
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty()
            && !self.line1.is_empty()
            && !self.city.is_empty()
            && !self.postal_code.is_empty()
            && !self.country.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(product: &str, qty: i64, cents: i64) -> CartLine {
        CartLine::new(
            ProductId::new(product),
            product,
            qty,
            Money::new(cents, Currency::USD),
        )
        .unwrap()
    }

    fn cart() -> Cart {
        Cart::new(
            CartOwner::Session("sess_1".to_string()),
            Currency::USD,
            Utc::now(),
        )
    }

    #[test]
    fn test_add_merges_same_product() {
        let mut cart = cart();
        cart.add_line(line("prd_a", 2, 2000), Utc::now()).unwrap();
        cart.add_line(line("prd_a", 1, 2000), Utc::now()).unwrap();
        assert_eq!(cart.lines.len(), 1);
        assert_eq!(cart.lines[0].quantity, 3);
    }

    #[test]
    fn test_subtotal() {
        let mut cart = cart();
        cart.add_line(line("prd_a", 2, 2000), Utc::now()).unwrap();
        cart.add_line(line("prd_b", 1, 1500), Utc::now()).unwrap();
        assert_eq!(cart.subtotal().amount_cents, 5500);
        assert_eq!(cart.total_quantity(), 3);
    }

    #[test]
    fn test_update_quantity_zero_removes() {
        let mut cart = cart();
        cart.add_line(line("prd_a", 2, 2000), Utc::now()).unwrap();
        cart.update_quantity(&ProductId::new("prd_a"), 0, Utc::now())
            .unwrap();
        assert!(cart.is_empty());
    }

    #[test]
    fn test_quantity_limits() {
        assert!(matches!(
            CartLine::new(
                ProductId::new("prd_a"),
                "a",
                0,
                Money::new(1, Currency::USD)
            ),
            Err(CommerceError::InvalidQuantity(0))
        ));
        let mut cart = cart();
        cart.add_line(line("prd_a", 999, 100), Utc::now()).unwrap();
        assert!(matches!(
            cart.add_line(line("prd_a", 1, 100), Utc::now()),
            Err(CommerceError::QuantityExceedsLimit(1000, _))
        ));
    }

    #[test]
    fn test_remove_missing_line() {
        let mut cart = cart();
        assert!(matches!(
            cart.remove_line(&ProductId::new("prd_x"), Utc::now()),
            Err(CommerceError::LineNotInCart(_))
        ));
    }
}
