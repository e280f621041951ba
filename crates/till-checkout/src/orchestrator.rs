//! The order orchestrator: one transaction from cart to order.
//!
//! Checkout validates the cart, prices the coupon, reserves every line
//! and persists the order, its frozen items and the coupon usage as a
//! single atomic unit. The payment-gateway network call happens
//! strictly after that transaction commits, so gateway latency never
//! holds a stock lock.

use crate::config::CheckoutConfig;
use crate::discount::DiscountEngine;
use crate::error::CheckoutError;
use crate::gateway::PaymentGateway;
use crate::ledger::InventoryLedger;
use crate::notify::{NotificationDispatcher, NotificationEvent};
use crate::shipping::ShippingCostCalculator;
use crate::validator::{CartValidator, LineIssue};
use std::sync::Arc;
use till_commerce::cart::{Address, Cart, CartLine, CartOwner};
use till_commerce::catalog::{ProductCatalog, ProductSnapshot};
use till_commerce::clock::Clock;
use till_commerce::coupon::{EligibleLine, UserContext};
use till_commerce::error::CommerceError;
use till_commerce::ids::OrderId;
use till_commerce::money::Money;
use till_commerce::order::{
    generate_order_number, Order, OrderEvent, OrderItem, OrderStatus, OrderTotals, PaymentStatus,
};
use till_commerce::shipping::ShippingSelection;
use till_store::cart_store::CartStore;
use till_store::records::{CouponUsage, Payment};
use till_store::repos::{coupons, orders, usages};
use till_store::Store;

/// What a checkout submits.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub owner: CartOwner,
    pub email: String,
    pub coupon_code: Option<String>,
    pub shipping: ShippingSelection,
    pub shipping_address: Address,
    /// Defaults to the shipping address.
    pub billing_address: Option<Address>,
}

/// A successful checkout.
#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
    pub order: Order,
    /// Absent when the gateway timed out; the order stays pending and
    /// the webhook or a poll settles it.
    pub payment: Option<Payment>,
    /// Non-blocking validator findings (price drift, clampable stock).
    pub warnings: Vec<LineIssue>,
    pub gateway_timed_out: bool,
}

/// Drives the checkout pipeline and the order lifecycle.
pub struct OrderOrchestrator {
    store: Store,
    catalog: Arc<dyn ProductCatalog>,
    carts: Arc<dyn CartStore>,
    gateway: Arc<PaymentGateway>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    validator: CartValidator,
    engine: DiscountEngine,
    ledger: InventoryLedger,
    shipping: ShippingCostCalculator,
    config: CheckoutConfig,
}

impl OrderOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        catalog: Arc<dyn ProductCatalog>,
        carts: Arc<dyn CartStore>,
        gateway: Arc<PaymentGateway>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
        shipping: ShippingCostCalculator,
        config: CheckoutConfig,
    ) -> Self {
        let engine = DiscountEngine::new(Arc::clone(&clock));
        let ledger = InventoryLedger::new(config.low_stock_threshold, Arc::clone(&clock));
        Self {
            store,
            catalog,
            carts,
            gateway,
            dispatcher,
            clock,
            validator: CartValidator,
            engine,
            ledger,
            shipping,
            config,
        }
    }

    /// Convert the owner's cart into a pending order.
    ///
    /// Everything up to the commit is one transaction: a failure at any
    /// step (validation, coupon, any single reservation, order number)
    /// aborts the whole thing and no partial state survives. The
    /// gateway call comes after the commit.
    pub async fn checkout(
        &self,
        request: CheckoutRequest,
        user: UserContext,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let cart = self
            .carts
            .load(&request.owner)
            .ok_or(CheckoutError::CartNotFound)?;
        if cart.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }

        let validation = self.validator.validate(&cart, self.catalog.as_ref());
        if !validation.valid() {
            return Err(CheckoutError::Validation(validation));
        }
        let warnings = validation.warnings;

        let priced = self.price_lines(&cart)?;
        let eligible_lines: Vec<EligibleLine> = priced
            .iter()
            .map(|(line, product)| EligibleLine {
                product_id: line.product_id.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                category_ids: product.category_ids.clone(),
            })
            .collect();
        let subtotal = cart.subtotal();
        let total_weight: i64 = priced
            .iter()
            .map(|(line, product)| product.weight_grams * line.quantity)
            .sum();

        let now = self.clock.now();
        let order_id = OrderId::generate();
        let mut user = user;

        let mut tx = self.store.begin();

        if let Some(user_id) = &user.user_id {
            user.is_new_customer = orders::count_settled_for_user(&tx, user_id) == 0;
        }

        let applied = match &request.coupon_code {
            Some(code) => Some(self.engine.validate_and_price(
                &mut tx,
                code,
                &eligible_lines,
                subtotal,
                &user,
            )?),
            None => None,
        };
        let discount = applied
            .as_ref()
            .map(|a| a.discount)
            .unwrap_or_else(|| Money::zero(cart.currency));
        let free_shipping = applied.as_ref().is_some_and(|a| a.free_shipping);
        let shipping_cost =
            self.shipping
                .compute(&request.shipping, total_weight, subtotal, free_shipping);

        // Reserve in sorted product order so concurrent checkouts take
        // row locks in the same sequence.
        let mut to_reserve: Vec<&CartLine> = cart.lines.iter().collect();
        to_reserve.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        let mut reserved = Vec::with_capacity(to_reserve.len());
        for line in to_reserve {
            let movement = self
                .ledger
                .reserve(&mut tx, &line.product_id, line.quantity, &order_id)?;
            reserved.push(movement);
        }

        let totals = OrderTotals::compute(
            subtotal,
            discount,
            shipping_cost,
            Money::zero(cart.currency),
        )?;

        let mut order_number = None;
        for _ in 0..self.config.order_number_attempts {
            let candidate = generate_order_number();
            if orders::claim_order_number(&mut tx, &candidate, &order_id)? {
                order_number = Some(candidate);
                break;
            }
        }
        let order_number = order_number.ok_or(CheckoutError::OrderNumberExhausted)?;

        let items: Vec<OrderItem> = cart
            .lines
            .iter()
            .map(|line| {
                OrderItem::freeze(
                    line.product_id.clone(),
                    line.name.clone(),
                    line.quantity,
                    line.unit_price,
                )
            })
            .collect();
        let billing_address = request
            .billing_address
            .clone()
            .unwrap_or_else(|| request.shipping_address.clone());
        let order = Order {
            id: order_id.clone(),
            order_number,
            user_id: user.user_id.clone(),
            email: request.email.clone(),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            items,
            totals,
            currency: cart.currency,
            coupon_code: applied.as_ref().map(|a| a.coupon.code.clone()),
            shipping_address: request.shipping_address.clone(),
            billing_address,
            admin_note: None,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        };
        orders::insert(&mut tx, order.clone())?;

        if let Some(applied) = &applied {
            usages::insert(
                &mut tx,
                CouponUsage::redeem(
                    applied.coupon.id.clone(),
                    user.user_id.clone(),
                    order_id.clone(),
                    discount,
                    now,
                ),
            )?;
        }

        tx.commit()?;
        tracing::info!(
            order_number = %order.order_number,
            total = %order.totals.total_amount,
            "order created"
        );

        // Post-commit: the cart is spent, alerts fan out. None of this
        // can unwind the order.
        self.carts.clear(&request.owner);
        self.ledger
            .publish_stock_events(&self.store, &reserved, self.dispatcher.as_ref());
        self.dispatcher.notify(NotificationEvent::OrderCreated {
            order_id: order.id.clone(),
            order_number: order.order_number.clone(),
            total: order.totals.total_amount,
        });

        match self.gateway.create_intent(&order).await {
            Ok(payment) => Ok(CheckoutOutcome {
                order,
                payment: Some(payment),
                warnings,
                gateway_timed_out: false,
            }),
            Err(CheckoutError::GatewayTimeout) => {
                // Timeout is not failure: the charge may have landed.
                // Stock stays reserved; reconciliation settles it.
                tracing::warn!(order_number = %order.order_number, "gateway timed out, order stays pending");
                Ok(CheckoutOutcome {
                    order,
                    payment: None,
                    warnings,
                    gateway_timed_out: true,
                })
            }
            Err(CheckoutError::PaymentDeclined { reason }) => {
                self.fail_pending_order(&order.id, &reason)?;
                Err(CheckoutError::PaymentDeclined { reason })
            }
            Err(other) => Err(other),
        }
    }

    /// Cancel an order. Legal only from pending or confirmed.
    ///
    /// Releases every reserved line. The coupon usage row stays in the
    /// count, only tagged: cancel-and-retry must not reset the limit.
    pub fn cancel(&self, order_id: &OrderId) -> Result<Order, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.store.begin();
        let mut order = orders::get_for_update(&mut tx, order_id)?;
        order.apply(OrderEvent::Cancel, now)?;

        // Coupon lock before product locks, same order as checkout.
        if let Some(usage) = usages::find_by_order(&tx, order_id) {
            coupons::get_for_update(&mut tx, &usage.coupon_id)?;
            usages::mark_cancelled(&mut tx, usage)?;
        }

        let mut items = order.items.clone();
        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        let mut released = Vec::new();
        for item in &items {
            if let Some(movement) =
                self.ledger
                    .release(&mut tx, &item.product_id, item.quantity, order_id)?
            {
                released.push(movement);
            }
        }
        orders::put(&mut tx, order.clone())?;

        tx.commit()?;
        tracing::info!(order_number = %order.order_number, "order cancelled");

        self.ledger
            .publish_stock_events(&self.store, &released, self.dispatcher.as_ref());
        self.dispatcher.notify(NotificationEvent::OrderCancelled {
            order_id: order.id.clone(),
            order_number: order.order_number.clone(),
        });
        Ok(order)
    }

    /// Fulfillment progression, each through the transition guard.
    pub fn mark_processing(&self, order_id: &OrderId) -> Result<Order, CheckoutError> {
        self.transition(order_id, OrderEvent::StartProcessing)
    }

    pub fn mark_shipped(&self, order_id: &OrderId) -> Result<Order, CheckoutError> {
        self.transition(order_id, OrderEvent::Ship)
    }

    pub fn mark_delivered(&self, order_id: &OrderId) -> Result<Order, CheckoutError> {
        self.transition(order_id, OrderEvent::Deliver)
    }

    fn transition(&self, order_id: &OrderId, event: OrderEvent) -> Result<Order, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.store.begin();
        let mut order = orders::get_for_update(&mut tx, order_id)?;
        order.apply(event, now)?;
        orders::put(&mut tx, order.clone())?;
        tx.commit()?;
        Ok(order)
    }

    /// Shared failure path for a hard decline at intent creation:
    /// guarded move to payment_failed, stock back, customer notified.
    fn fail_pending_order(&self, order_id: &OrderId, reason: &str) -> Result<(), CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.store.begin();
        let mut order = orders::get_for_update(&mut tx, order_id)?;
        match order.apply(OrderEvent::PaymentFailed, now) {
            Ok(_) => {}
            Err(CommerceError::InvalidTransition { .. }) => {
                // Someone else settled the order first; nothing to do.
                tx.rollback();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        order.set_payment_status(PaymentStatus::Failed, now);

        let mut items = order.items.clone();
        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        let mut released = Vec::new();
        for item in &items {
            if let Some(movement) =
                self.ledger
                    .release(&mut tx, &item.product_id, item.quantity, order_id)?
            {
                released.push(movement);
            }
        }
        orders::put(&mut tx, order.clone())?;
        tx.commit()?;

        self.ledger
            .publish_stock_events(&self.store, &released, self.dispatcher.as_ref());
        self.dispatcher.notify(NotificationEvent::PaymentFailed {
            order_id: order.id.clone(),
            order_number: order.order_number.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn price_lines(&self, cart: &Cart) -> Result<Vec<(CartLine, ProductSnapshot)>, CheckoutError> {
        cart.lines
            .iter()
            .map(|line| {
                self.catalog
                    .product(&line.product_id)
                    .map(|product| (line.clone(), product))
                    .ok_or_else(|| CheckoutError::NotFound(line.product_id.to_string()))
            })
            .collect()
    }
}
