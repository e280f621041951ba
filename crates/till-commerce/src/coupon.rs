//! Coupon model, restriction rules and pure pricing math.
//!
//! Usage counting and eligibility against live data live in the
//! checkout crate; this module is the arithmetic and the rule
//! structures, valid by construction.

use crate::error::CommerceError;
use crate::ids::{CategoryId, CouponId, ProductId, UserId};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a coupon is worth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CouponValue {
    /// Percentage off the eligible subtotal (0 < value <= 100).
    Percentage(f64),
    /// Fixed amount off, capped at the eligible subtotal.
    Fixed(Money),
    /// Shipping is zeroed by the orchestrator; the discount amount
    /// itself is zero.
    FreeShipping,
    /// Buy `buy` units, get `get` units at `discount_percent` off.
    BuyXGetY {
        buy: i64,
        get: i64,
        discount_percent: f64,
    },
}

/// A single restriction rule. Rules are structured and validated when
/// the coupon is written, not parsed out of a blob at read time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Restriction {
    /// Only these products are eligible.
    ProductIds(Vec<ProductId>),
    /// Only products in these categories are eligible.
    CategoryIds(Vec<CategoryId>),
    /// Only users in one of these groups may redeem.
    UserGroups(Vec<String>),
    /// Only users with no prior completed order may redeem.
    NewCustomersOnly,
    /// Explicit allowlist of user ids or emails.
    AllowedUsers(Vec<String>),
    /// Carts containing any of these products are ineligible.
    ExcludedProductIds(Vec<ProductId>),
    /// Carts containing products in these categories are ineligible.
    ExcludedCategoryIds(Vec<CategoryId>),
}

impl Restriction {
    /// Reject degenerate rules at write time.
    pub fn validate(&self) -> Result<(), CommerceError> {
        let empty = match self {
            Restriction::ProductIds(v) => v.is_empty(),
            Restriction::CategoryIds(v) => v.is_empty(),
            Restriction::UserGroups(v) => v.is_empty(),
            Restriction::AllowedUsers(v) => v.is_empty(),
            Restriction::ExcludedProductIds(v) => v.is_empty(),
            Restriction::ExcludedCategoryIds(v) => v.is_empty(),
            Restriction::NewCustomersOnly => false,
        };
        if empty {
            return Err(CommerceError::InvalidCoupon(
                "restriction list must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A coupon definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coupon {
    pub id: CouponId,
    /// Unique redemption code, stored uppercase.
    pub code: String,
    pub name: String,
    pub value: CouponValue,
    /// Cart subtotal must be at least this much.
    pub min_order_amount: Option<Money>,
    /// Cart subtotal must be at most this much.
    pub max_order_amount: Option<Money>,
    /// Hard cap on the computed discount.
    pub max_discount_amount: Option<Money>,
    /// Total redemptions allowed across all users.
    pub usage_limit: Option<i64>,
    /// Redemptions allowed per user.
    pub usage_limit_per_user: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub restrictions: Vec<Restriction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Coupon {
    pub fn new(code: impl Into<String>, value: CouponValue, now: DateTime<Utc>) -> Self {
        let code = code.into().to_uppercase();
        Self {
            id: CouponId::generate(),
            name: code.clone(),
            code,
            value,
            min_order_amount: None,
            max_order_amount: None,
            max_discount_amount: None,
            usage_limit: None,
            usage_limit_per_user: None,
            starts_at: None,
            expires_at: None,
            active: true,
            restrictions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_min_order(mut self, amount: Money) -> Self {
        self.min_order_amount = Some(amount);
        self
    }

    pub fn with_usage_limit(mut self, limit: i64) -> Self {
        self.usage_limit = Some(limit);
        self
    }

    pub fn with_per_user_limit(mut self, limit: i64) -> Self {
        self.usage_limit_per_user = Some(limit);
        self
    }

    pub fn with_max_discount(mut self, amount: Money) -> Self {
        self.max_discount_amount = Some(amount);
        self
    }

    pub fn with_restriction(mut self, restriction: Restriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    pub fn with_window(
        mut self,
        starts_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.starts_at = starts_at;
        self.expires_at = expires_at;
        self
    }

    /// Write-time validation: value ranges, window order, rule shape.
    pub fn validate(&self) -> Result<(), CommerceError> {
        match &self.value {
            CouponValue::Percentage(p) => {
                if !(*p > 0.0 && *p <= 100.0) {
                    return Err(CommerceError::InvalidCoupon(format!(
                        "percentage out of range: {p}"
                    )));
                }
            }
            CouponValue::Fixed(amount) => {
                if !amount.is_positive() {
                    return Err(CommerceError::InvalidCoupon(
                        "fixed discount must be positive".to_string(),
                    ));
                }
            }
            CouponValue::FreeShipping => {}
            CouponValue::BuyXGetY {
                buy,
                get,
                discount_percent,
            } => {
                if *buy < 1 || *get < 1 {
                    return Err(CommerceError::InvalidCoupon(
                        "buy and get quantities must be at least 1".to_string(),
                    ));
                }
                if !(*discount_percent > 0.0 && *discount_percent <= 100.0) {
                    return Err(CommerceError::InvalidCoupon(format!(
                        "discount percent out of range: {discount_percent}"
                    )));
                }
            }
        }
        if let (Some(starts), Some(expires)) = (self.starts_at, self.expires_at) {
            if starts > expires {
                return Err(CommerceError::InvalidCoupon(
                    "starts_at after expires_at".to_string(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min_order_amount, self.max_order_amount) {
            if min.amount_cents > max.amount_cents {
                return Err(CommerceError::InvalidCoupon(
                    "min order amount above max order amount".to_string(),
                ));
            }
        }
        for limit in [self.usage_limit, self.usage_limit_per_user].into_iter().flatten() {
            if limit < 1 {
                return Err(CommerceError::InvalidCoupon(format!(
                    "usage limit must be at least 1, got {limit}"
                )));
            }
        }
        for restriction in &self.restrictions {
            restriction.validate()?;
        }
        Ok(())
    }

    /// Time-window check against an explicit now.
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        if let Some(starts) = self.starts_at {
            if now < starts {
                return false;
            }
        }
        if let Some(expires) = self.expires_at {
            if now > expires {
                return false;
            }
        }
        true
    }

    pub fn grants_free_shipping(&self) -> bool {
        matches!(self.value, CouponValue::FreeShipping)
    }
}

/// A cart line enriched with the category set needed for restriction
/// matching. Built by the checkout crate from cart + catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibleLine {
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: Money,
    pub category_ids: Vec<CategoryId>,
}

impl EligibleLine {
    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// Identity facts used for user-level restrictions.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub user_id: Option<UserId>,
    pub email: Option<String>,
    pub groups: Vec<String>,
    /// No prior non-cancelled order.
    pub is_new_customer: bool,
}

/// Outcome of matching cart lines against a coupon's restrictions.
#[derive(Debug, Clone, PartialEq)]
pub struct RestrictionMatch {
    /// Indices into the input slice of lines that inclusion rules admit.
    pub eligible: Vec<usize>,
    /// Some line hit an exclusion rule; the coupon is ineligible for
    /// this cart as a whole.
    pub exclusion_hit: Option<ProductId>,
}

/// Match lines against the product/category rule families.
///
/// Inclusion rules narrow the eligible set; with no inclusion rules
/// every line is eligible. Any exclusion hit poisons the whole cart.
pub fn match_restrictions(restrictions: &[Restriction], lines: &[EligibleLine]) -> RestrictionMatch {
    let mut included_products: Option<Vec<&ProductId>> = None;
    let mut included_categories: Option<Vec<&CategoryId>> = None;
    let mut excluded_products: Vec<&ProductId> = Vec::new();
    let mut excluded_categories: Vec<&CategoryId> = Vec::new();

    for rule in restrictions {
        match rule {
            Restriction::ProductIds(ids) => {
                included_products.get_or_insert_with(Vec::new).extend(ids)
            }
            Restriction::CategoryIds(ids) => {
                included_categories.get_or_insert_with(Vec::new).extend(ids)
            }
            Restriction::ExcludedProductIds(ids) => excluded_products.extend(ids),
            Restriction::ExcludedCategoryIds(ids) => excluded_categories.extend(ids),
            // User-level rules are checked by the engine, not per line.
            Restriction::UserGroups(_)
            | Restriction::NewCustomersOnly
            | Restriction::AllowedUsers(_) => {}
        }
    }

    let mut eligible = Vec::new();
    let mut exclusion_hit = None;
    for (idx, line) in lines.iter().enumerate() {
        let excluded = excluded_products.iter().any(|p| **p == line.product_id)
            || line
                .category_ids
                .iter()
                .any(|c| excluded_categories.iter().any(|e| *e == c));
        if excluded {
            exclusion_hit.get_or_insert_with(|| line.product_id.clone());
            continue;
        }

        let included = match (&included_products, &included_categories) {
            (None, None) => true,
            (products, categories) => {
                products
                    .as_ref()
                    .is_some_and(|ids| ids.iter().any(|p| **p == line.product_id))
                    || categories.as_ref().is_some_and(|ids| {
                        line.category_ids.iter().any(|c| ids.iter().any(|i| *i == c))
                    })
            }
        };
        if included {
            eligible.push(idx);
        }
    }

    RestrictionMatch {
        eligible,
        exclusion_hit,
    }
}

/// Whether the user-level rules admit this user.
pub fn user_allowed(restrictions: &[Restriction], user: &UserContext) -> bool {
    for rule in restrictions {
        match rule {
            Restriction::UserGroups(groups) => {
                if !user.groups.iter().any(|g| groups.contains(g)) {
                    return false;
                }
            }
            Restriction::NewCustomersOnly => {
                if !user.is_new_customer {
                    return false;
                }
            }
            Restriction::AllowedUsers(allow) => {
                let by_id = user
                    .user_id
                    .as_ref()
                    .is_some_and(|id| allow.iter().any(|a| a == id.as_str()));
                let by_email = user
                    .email
                    .as_ref()
                    .is_some_and(|email| allow.iter().any(|a| a.eq_ignore_ascii_case(email)));
                if !by_id && !by_email {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Price a coupon against the eligible lines.
///
/// The result is capped by `max_discount_amount` when set, then by the
/// eligible subtotal, and is always rounded to the minor unit.
pub fn discount_for(coupon: &Coupon, eligible: &[EligibleLine]) -> Money {
    let currency = eligible
        .first()
        .map(|l| l.unit_price.currency)
        .unwrap_or_default();
    let eligible_subtotal = eligible
        .iter()
        .fold(Money::zero(currency), |acc, l| acc + l.line_total());

    let raw = match &coupon.value {
        CouponValue::Percentage(percent) => eligible_subtotal.percentage(*percent),
        CouponValue::Fixed(amount) => amount.min(&eligible_subtotal),
        CouponValue::FreeShipping => Money::zero(currency),
        CouponValue::BuyXGetY {
            buy,
            get,
            discount_percent,
        } => buy_x_get_y(eligible, *buy, *get, *discount_percent, currency),
    };

    let capped = match coupon.max_discount_amount {
        Some(cap) => raw.min(&cap),
        None => raw,
    };
    capped.min(&eligible_subtotal)
}

/// Buy-X-get-Y pricing.
///
/// Free units accrue per line from that line's quantity, then are spent
/// across the eligible lines sorted cheapest-first — the cheapest units
/// are the ones discounted, which minimizes the discount granted.
fn buy_x_get_y(
    eligible: &[EligibleLine],
    buy: i64,
    get: i64,
    discount_percent: f64,
    currency: crate::money::Currency,
) -> Money {
    let mut free_units: i64 = eligible.iter().map(|l| (l.quantity / buy) * get).sum();
    if free_units <= 0 {
        return Money::zero(currency);
    }

    let mut sorted: Vec<&EligibleLine> = eligible.iter().collect();
    sorted.sort_by_key(|l| l.unit_price.amount_cents);

    let mut discount = Money::zero(currency);
    for line in sorted {
        if free_units == 0 {
            break;
        }
        let consumed = free_units.min(line.quantity);
        discount = discount + line.unit_price.times(consumed).percentage(discount_percent);
        free_units -= consumed;
    }
    discount
}
