//! End-to-end pipeline tests: cart to order to webhook settlement.

use chrono::Utc;
use std::sync::Arc;
use till_checkout::api;
use till_checkout::{
    CheckoutConfig, CheckoutError, CheckoutOutcome, CheckoutRequest, CollectingDispatcher,
    CouponIneligibleReason, GatewayEvent, GatewayEventKind, InventoryLedger, NotificationEvent,
    OrderOrchestrator, PaymentGateway, ReconcileOutcome, ShippingCostCalculator, WebhookReceiver,
    WebhookVerifier,
};
use till_checkout::gateway::{StaticGatewayBehavior, StaticGatewayClient};
use till_commerce::cart::{Address, Cart, CartLine, CartOwner};
use till_commerce::catalog::ProductSnapshot;
use till_commerce::clock::{Clock, SystemClock};
use till_commerce::coupon::{Coupon, CouponValue, UserContext};
use till_commerce::ids::{OrderId, ProductId, UserId};
use till_commerce::money::{Currency, Money};
use till_commerce::order::{OrderStatus, PaymentStatus};
use till_commerce::shipping::{BandedRateProvider, ShippingSelection, ShippingZone};
use till_store::cart_store::{CartStore, RoutingCartStore};
use till_store::{AlertKind, Store, StoreCatalog};

const WEBHOOK_SECRET: &[u8] = b"whsec_pipeline_tests";

struct Pipeline {
    store: Store,
    carts: Arc<RoutingCartStore>,
    dispatcher: Arc<CollectingDispatcher>,
    client: Arc<StaticGatewayClient>,
    orchestrator: OrderOrchestrator,
    receiver: WebhookReceiver,
    clock: Arc<dyn Clock>,
}

fn usd(cents: i64) -> Money {
    Money::new(cents, Currency::USD)
}

fn product(id: &str, price_cents: i64, stock: i64) -> ProductSnapshot {
    ProductSnapshot {
        id: ProductId::new(id),
        name: id.to_string(),
        price: usd(price_cents),
        sale_price: None,
        stock_quantity: stock,
        is_active: true,
        weight_grams: 400,
        category_ids: vec![],
        updated_at: Utc::now(),
    }
}

fn address() -> Address {
    Address {
        name: "Ada Buyer".to_string(),
        line1: "1 Example Way".to_string(),
        line2: None,
        city: "Springfield".to_string(),
        region: None,
        postal_code: "12345".to_string(),
        country: "US".to_string(),
    }
}

fn pipeline() -> Pipeline {
    let store = Store::default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dispatcher = Arc::new(CollectingDispatcher::new());
    let client = Arc::new(StaticGatewayClient::succeeding());
    let config = CheckoutConfig::default();

    let ledger = InventoryLedger::new(config.low_stock_threshold, clock.clone());
    let gateway = Arc::new(PaymentGateway::new(
        store.clone(),
        client.clone(),
        config.gateway.clone(),
        clock.clone(),
        dispatcher.clone(),
        ledger,
    ));
    let carts = Arc::new(RoutingCartStore::new(
        chrono::Duration::minutes(30),
        clock.clone(),
    ));
    let orchestrator = OrderOrchestrator::new(
        store.clone(),
        Arc::new(StoreCatalog::new(store.clone())),
        carts.clone(),
        gateway.clone(),
        dispatcher.clone(),
        clock.clone(),
        ShippingCostCalculator::new(Arc::new(BandedRateProvider::standard(Currency::USD))),
        config.clone(),
    );
    let receiver = WebhookReceiver::new(
        WebhookVerifier::new(WEBHOOK_SECRET, config.webhook_tolerance_secs, clock.clone()),
        gateway,
    );

    Pipeline {
        store,
        carts,
        dispatcher,
        client,
        orchestrator,
        receiver,
        clock,
    }
}

impl Pipeline {
    fn seed_cart(&self, session: &str, lines: &[(&str, i64)]) -> CartOwner {
        let owner = CartOwner::Session(session.to_string());
        let now = self.clock.now();
        let mut cart = Cart::new(owner.clone(), Currency::USD, now);
        for (id, qty) in lines {
            let snapshot = self.store.product(&ProductId::new(*id)).unwrap();
            cart.add_line(
                CartLine::new(
                    snapshot.id.clone(),
                    snapshot.name.clone(),
                    *qty,
                    snapshot.effective_price(),
                )
                .unwrap(),
                now,
            )
            .unwrap();
        }
        self.carts.save(&cart);
        owner
    }

    fn request(&self, owner: CartOwner, coupon: Option<&str>) -> CheckoutRequest {
        CheckoutRequest {
            owner,
            email: "ada@example.com".to_string(),
            coupon_code: coupon.map(str::to_string),
            shipping: ShippingSelection {
                method: "standard".to_string(),
                zone: ShippingZone::Domestic,
            },
            shipping_address: address(),
            billing_address: None,
        }
    }

    fn deliver(&self, intent_id: &str, kind: GatewayEventKind) -> ReconcileOutcome {
        let body = serde_json::to_vec(&GatewayEvent {
            event_id: format!("evt_{}", rand_tag()),
            intent_id: intent_id.to_string(),
            kind,
        })
        .unwrap();
        let header = WebhookVerifier::new(WEBHOOK_SECRET, 300, self.clock.clone())
            .sign(&body, self.clock.now());
        let response = self.receiver.handle(&body, &header);
        assert_eq!(response.status, http::StatusCode::OK);
        response.outcome.unwrap()
    }

    fn stock(&self, id: &str) -> i64 {
        self.store
            .product(&ProductId::new(id))
            .unwrap()
            .stock_quantity
    }
}

fn rand_tag() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!("{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

async fn checkout_ok(p: &Pipeline, owner: CartOwner, coupon: Option<&str>) -> CheckoutOutcome {
    p.orchestrator
        .checkout(p.request(owner, coupon), UserContext::default())
        .await
        .unwrap()
}

/// The worked scenario: 2 x 20.00 (stock 5) + 1 x 15.00 (stock 1),
/// SAVE10 at 10% with a 10.00 minimum, flat 5.00 domestic shipping.
#[tokio::test]
async fn scenario_totals_stock_and_usage() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    p.store.put_product(product("prd_b", 1500, 1));
    p.store
        .put_coupon(
            Coupon::new("SAVE10", CouponValue::Percentage(10.0), p.clock.now())
                .with_min_order(usd(1000)),
        )
        .unwrap();

    let owner = p.seed_cart("sess_1", &[("prd_a", 2), ("prd_b", 1)]);
    let outcome = checkout_ok(&p, owner.clone(), Some("SAVE10")).await;

    let totals = outcome.order.totals;
    assert_eq!(totals.subtotal, usd(5500));
    assert_eq!(totals.discount_amount, usd(550));
    assert_eq!(totals.shipping_amount, usd(500));
    assert_eq!(totals.tax_amount, usd(0));
    assert_eq!(totals.total_amount, usd(5450));
    assert!(totals.verify());

    // Stock moved 5 -> 3 and 1 -> 0; the second crossing opens an
    // out-of-stock alert.
    assert_eq!(p.stock("prd_a"), 3);
    assert_eq!(p.stock("prd_b"), 0);
    assert!(p
        .store
        .open_alert(&ProductId::new("prd_b"), AlertKind::OutOfStock)
        .is_some());

    // Exactly one usage row, tied to the order.
    let coupon = p.store.coupon_by_code("SAVE10").unwrap();
    let usages = p.store.usages_for(&coupon.id);
    assert_eq!(usages.len(), 1);
    assert_eq!(usages[0].order_id, outcome.order.id);
    assert_eq!(usages[0].discount_amount, usd(550));

    // The cart is spent.
    assert!(p.carts.load(&owner).is_none());

    // Payment intent persisted and exposed.
    let payment = outcome.payment.unwrap();
    assert_eq!(payment.amount, usd(5450));
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.client_secret.is_some());

    // Ledger agrees with the counters.
    let ledger = InventoryLedger::new(5, p.clock.clone());
    assert!(ledger.verify(&p.store, &ProductId::new("prd_a")));
    assert!(ledger.verify(&p.store, &ProductId::new("prd_b")));
}

/// Buy 2 get 1 free at 100%: 3 units at $10 plus 1 at $8. One free
/// unit is earned and it lands on the cheapest eligible unit.
#[tokio::test]
async fn scenario_buy_x_get_y_discounts_cheapest() {
    let p = pipeline();
    p.store.put_product(product("prd_ten", 1000, 10));
    p.store.put_product(product("prd_eight", 800, 10));
    p.store
        .put_coupon(Coupon::new(
            "B2G1",
            CouponValue::BuyXGetY {
                buy: 2,
                get: 1,
                discount_percent: 100.0,
            },
            p.clock.now(),
        ))
        .unwrap();

    let owner = p.seed_cart("sess_1", &[("prd_ten", 3), ("prd_eight", 1)]);
    let outcome = checkout_ok(&p, owner, Some("B2G1")).await;
    assert_eq!(outcome.order.totals.discount_amount, usd(800));
}

/// Duplicate and out-of-order webhook deliveries settle to the same
/// terminal state as a single delivery, with no repeated side effects.
#[tokio::test]
async fn webhook_idempotence() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    let owner = p.seed_cart("sess_1", &[("prd_a", 2)]);
    let outcome = checkout_ok(&p, owner, None).await;
    let intent_id = outcome.payment.unwrap().intent_id;

    assert_eq!(
        p.deliver(&intent_id, GatewayEventKind::Succeeded),
        ReconcileOutcome::Confirmed
    );
    assert_eq!(
        p.deliver(&intent_id, GatewayEventKind::Succeeded),
        ReconcileOutcome::DuplicateDelivery
    );
    // A stale failure after success must not fail the order or move
    // stock.
    assert_eq!(
        p.deliver(
            &intent_id,
            GatewayEventKind::Failed {
                reason: "stale".to_string()
            }
        ),
        ReconcileOutcome::DuplicateDelivery
    );

    let order = p.store.order(&outcome.order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Completed);
    assert_eq!(p.stock("prd_a"), 3);

    // Confirmation side effects ran exactly once.
    assert_eq!(
        p.dispatcher
            .count_matching(|e| matches!(e, NotificationEvent::OrderConfirmed { .. })),
        1
    );
}

/// A failed payment moves the order to payment_failed and returns the
/// stock; a duplicate failure changes nothing further.
#[tokio::test]
async fn webhook_failure_releases_stock_once() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    let owner = p.seed_cart("sess_1", &[("prd_a", 2)]);
    let outcome = checkout_ok(&p, owner, None).await;
    let intent_id = outcome.payment.unwrap().intent_id;
    assert_eq!(p.stock("prd_a"), 3);

    assert_eq!(
        p.deliver(
            &intent_id,
            GatewayEventKind::Failed {
                reason: "card_declined".to_string()
            }
        ),
        ReconcileOutcome::FailedApplied
    );
    assert_eq!(p.stock("prd_a"), 5);

    let order = p.store.order(&outcome.order.id).unwrap();
    assert_eq!(order.status, OrderStatus::PaymentFailed);

    // Replay: no double release.
    assert_eq!(
        p.deliver(
            &intent_id,
            GatewayEventKind::Failed {
                reason: "card_declined".to_string()
            }
        ),
        ReconcileOutcome::DuplicateDelivery
    );
    assert_eq!(p.stock("prd_a"), 5);
    assert_eq!(
        p.dispatcher
            .count_matching(|e| matches!(e, NotificationEvent::PaymentFailed { .. })),
        1
    );

    let ledger = InventoryLedger::new(5, p.clock.clone());
    assert!(ledger.verify(&p.store, &ProductId::new("prd_a")));
}

/// N concurrent checkouts race for a usage_limit=1 coupon and the last
/// unit of stock: exactly one order wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_one_winner() {
    let p = Arc::new(pipeline());
    p.store.put_product(product("prd_last", 2000, 1));
    p.store
        .put_coupon(
            Coupon::new("LAST1", CouponValue::Percentage(10.0), p.clock.now())
                .with_usage_limit(1),
        )
        .unwrap();

    let mut owners = Vec::new();
    for i in 0..4 {
        owners.push(p.seed_cart(&format!("sess_{i}"), &[("prd_last", 1)]));
    }

    let mut handles = Vec::new();
    for (i, owner) in owners.into_iter().enumerate() {
        let p = Arc::clone(&p);
        handles.push(tokio::spawn(async move {
            let user = UserContext {
                user_id: Some(UserId::new(format!("usr_{i}"))),
                ..Default::default()
            };
            p.orchestrator
                .checkout(p.request(owner, Some("LAST1")), user)
                .await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(CheckoutError::InsufficientStock { .. })
            | Err(CheckoutError::CouponIneligible(
                CouponIneligibleReason::UsageLimitReached,
            )) => {}
            Err(other) => panic!("unexpected rejection: {other}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(p.stock("prd_last"), 0);

    let coupon = p.store.coupon_by_code("LAST1").unwrap();
    assert_eq!(p.store.usages_for(&coupon.id).len(), 1);
}

/// cancel() on a shipped order is a guarded no-op that reports the
/// invalid transition and leaves status, stock and payment untouched.
#[tokio::test]
async fn cancel_guard_on_shipped_order() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    let owner = p.seed_cart("sess_1", &[("prd_a", 2)]);
    let outcome = checkout_ok(&p, owner, None).await;
    let intent_id = outcome.payment.unwrap().intent_id;

    p.deliver(&intent_id, GatewayEventKind::Succeeded);
    p.orchestrator.mark_processing(&outcome.order.id).unwrap();
    p.orchestrator.mark_shipped(&outcome.order.id).unwrap();

    let err = p.orchestrator.cancel(&outcome.order.id).unwrap_err();
    assert!(matches!(err, CheckoutError::InvalidTransition { .. }));
    assert_eq!(api::status_for(&err), http::StatusCode::CONFLICT);

    let order = p.store.order(&outcome.order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Shipped);
    assert_eq!(order.payment_status, PaymentStatus::Completed);
    assert_eq!(p.stock("prd_a"), 3);
}

/// Cancelling keeps the coupon use burned: cancel-and-retry cannot
/// reset a usage limit.
#[tokio::test]
async fn cancel_keeps_coupon_use_counted() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    p.store
        .put_coupon(
            Coupon::new("ONEUSE", CouponValue::Percentage(10.0), p.clock.now())
                .with_usage_limit(1),
        )
        .unwrap();

    let owner = p.seed_cart("sess_1", &[("prd_a", 1)]);
    let outcome = checkout_ok(&p, owner, Some("ONEUSE")).await;
    p.orchestrator.cancel(&outcome.order.id).unwrap();
    assert_eq!(p.stock("prd_a"), 5);

    let coupon = p.store.coupon_by_code("ONEUSE").unwrap();
    let usages = p.store.usages_for(&coupon.id);
    assert_eq!(usages.len(), 1);
    assert!(usages[0].cancelled);

    // Retry with the same coupon: the burned use still counts.
    let owner = p.seed_cart("sess_2", &[("prd_a", 1)]);
    let err = p
        .orchestrator
        .checkout(p.request(owner, Some("ONEUSE")), UserContext::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CheckoutError::CouponIneligible(CouponIneligibleReason::UsageLimitReached)
    ));
}

/// Confirmation arriving after a cancel loses the race cleanly: the
/// order stays cancelled, stock stays released, and ops is alerted for
/// a manual refund.
#[tokio::test]
async fn cancel_beats_late_confirmation() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    let owner = p.seed_cart("sess_1", &[("prd_a", 2)]);
    let outcome = checkout_ok(&p, owner, None).await;
    let intent_id = outcome.payment.unwrap().intent_id;

    p.orchestrator.cancel(&outcome.order.id).unwrap();
    assert_eq!(p.stock("prd_a"), 5);

    assert_eq!(
        p.deliver(&intent_id, GatewayEventKind::Succeeded),
        ReconcileOutcome::GuardedNoOp
    );

    let order = p.store.order(&outcome.order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    // Stock was not re-reserved.
    assert_eq!(p.stock("prd_a"), 5);
    // Money moved though, so someone has to look at it.
    assert_eq!(
        p.dispatcher
            .count_matching(|e| matches!(e, NotificationEvent::OpsAlert { .. })),
        1
    );
}

/// Gateway timeout leaves the order pending with stock reserved; a
/// later create_intent retry reuses the same intent.
#[tokio::test]
async fn gateway_timeout_keeps_order_pending() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    p.client.set_behavior(StaticGatewayBehavior::Timeout);

    let owner = p.seed_cart("sess_1", &[("prd_a", 2)]);
    let outcome = checkout_ok(&p, owner, None).await;
    assert!(outcome.gateway_timed_out);
    assert!(outcome.payment.is_none());

    let order = p.store.order(&outcome.order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    // Timeout alone never releases stock.
    assert_eq!(p.stock("prd_a"), 3);
}

/// A hard decline at intent creation fails the order and returns the
/// stock.
#[tokio::test]
async fn declined_intent_fails_order_and_releases() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    p.client.set_behavior(StaticGatewayBehavior::Decline);

    let owner = p.seed_cart("sess_1", &[("prd_a", 2)]);
    let err = p
        .orchestrator
        .checkout(p.request(owner, None), UserContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::PaymentDeclined { .. }));
    assert_eq!(api::status_for(&err), http::StatusCode::PAYMENT_REQUIRED);

    assert_eq!(p.stock("prd_a"), 5);
    let orders: Vec<_> = p
        .dispatcher
        .events()
        .into_iter()
        .filter_map(|e| match e {
            NotificationEvent::PaymentFailed { order_id, .. } => Some(order_id),
            _ => None,
        })
        .collect();
    assert_eq!(orders.len(), 1);
    let order = p.store.order(&orders[0]).unwrap();
    assert_eq!(order.status, OrderStatus::PaymentFailed);
}

/// Refunds: partial leaves fulfillment alone, the final partial tips
/// the payment into fully refunded and retires the order.
#[tokio::test]
async fn refund_partial_then_full() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    let owner = p.seed_cart("sess_1", &[("prd_a", 2)]);
    let outcome = checkout_ok(&p, owner, None).await;
    let payment = outcome.payment.unwrap();
    p.deliver(&payment.intent_id, GatewayEventKind::Succeeded);
    p.client.set_behavior(StaticGatewayBehavior::Succeed);

    // Gateway reference for the refund calls.
    let gateway = {
        let ledger = InventoryLedger::new(5, p.clock.clone());
        PaymentGateway::new(
            p.store.clone(),
            p.client.clone(),
            Default::default(),
            p.clock.clone(),
            p.dispatcher.clone(),
            ledger,
        )
    };

    let partial = gateway
        .refund(&payment.id, Some(usd(1000)))
        .await
        .unwrap();
    assert_eq!(partial.status, PaymentStatus::PartiallyRefunded);
    assert_eq!(partial.refunded_amount, usd(1000));
    let order = p.store.order(&outcome.order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::PartiallyRefunded);

    // Over-asking clamps at the remaining paid amount.
    let full = gateway.refund(&payment.id, Some(usd(99_999))).await.unwrap();
    assert_eq!(full.status, PaymentStatus::Refunded);
    assert_eq!(full.refunded_amount, full.amount);
    let order = p.store.order(&outcome.order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);

    // A third refund has nothing left to take.
    let err = gateway.refund(&payment.id, Some(usd(100))).await.unwrap_err();
    assert!(matches!(err, CheckoutError::InvalidTransition { .. }));
}

/// Checkout with an invalid cart surfaces 422-class validation errors
/// and performs no writes.
#[tokio::test]
async fn invalid_cart_has_no_side_effects() {
    let p = pipeline();
    p.store.put_product(product("prd_gone", 2000, 0));
    let owner = p.seed_cart("sess_1", &[("prd_gone", 1)]);

    let err = p
        .orchestrator
        .checkout(p.request(owner.clone(), None), UserContext::default())
        .await
        .unwrap_err();
    assert_eq!(api::status_for(&err), http::StatusCode::UNPROCESSABLE_ENTITY);
    match err {
        CheckoutError::Validation(validation) => {
            assert!(!validation.valid());
        }
        other => panic!("expected validation failure, got {other}"),
    }
    // Cart retained, nothing reserved, nothing logged.
    assert!(p.carts.load(&owner).is_some());
    assert!(p.store.movements_for(&ProductId::new("prd_gone")).is_empty());
}

/// Validator warnings (price drift) ride through a successful checkout.
#[tokio::test]
async fn price_drift_warns_but_checks_out() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    let owner = p.seed_cart("sess_1", &[("prd_a", 1)]);

    // Price moves after the cart captured it.
    let mut drifted = p.store.product(&ProductId::new("prd_a")).unwrap();
    drifted.price = usd(1800);
    p.store.put_product(drifted);

    let outcome = checkout_ok(&p, owner, None).await;
    assert_eq!(outcome.warnings.len(), 1);
    // Frozen at the captured price.
    assert_eq!(outcome.order.totals.subtotal, usd(2000));
}

/// Orders march pending -> confirmed -> processing -> shipped ->
/// delivered, and an unknown order cancel reports not-found.
#[tokio::test]
async fn fulfillment_progression() {
    let p = pipeline();
    p.store.put_product(product("prd_a", 2000, 5));
    let owner = p.seed_cart("sess_1", &[("prd_a", 1)]);
    let outcome = checkout_ok(&p, owner, None).await;
    let intent_id = outcome.payment.unwrap().intent_id;
    p.deliver(&intent_id, GatewayEventKind::Succeeded);

    p.orchestrator.mark_processing(&outcome.order.id).unwrap();
    p.orchestrator.mark_shipped(&outcome.order.id).unwrap();
    let order = p.orchestrator.mark_delivered(&outcome.order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Delivered);

    // Skipping ahead is guarded.
    let err = p.orchestrator.mark_shipped(&outcome.order.id).unwrap_err();
    assert!(matches!(err, CheckoutError::InvalidTransition { .. }));

    let err = p.orchestrator.cancel(&OrderId::new("ord_missing")).unwrap_err();
    assert!(matches!(err, CheckoutError::NotFound(_)));
}
