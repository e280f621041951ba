//! Payment gateway adapter.
//!
//! Two halves: outbound calls (create intent, refund) with bounded
//! timeouts and retry for transient failures only, and inbound
//! reconciliation of webhook events. Reconciliation is idempotent and
//! order-tolerant: the Payment row's unique intent id plus the order
//! state machine's guard make duplicate or late deliveries safe no-ops.

use crate::config::GatewayConfig;
use crate::error::CheckoutError;
use crate::ledger::InventoryLedger;
use crate::notify::{NotificationDispatcher, NotificationEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use till_commerce::clock::Clock;
use till_commerce::error::CommerceError;
use till_commerce::ids::PaymentId;
use till_commerce::money::Money;
use till_commerce::order::{Order, OrderEvent, PaymentStatus};
use till_store::records::Payment;
use till_store::repos::{orders, payments};
use till_store::{Store, StoreError};

/// Outbound intent creation request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateIntentRequest {
    /// The order number doubles as the gateway idempotency key, so a
    /// retried creation cannot double-charge.
    pub idempotency_key: String,
    pub amount: Money,
}

/// What the gateway returns for a created intent.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayIntent {
    pub intent_id: String,
    pub client_secret: String,
}

/// Transport-level gateway failures.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("payment declined: {reason}")]
    Declined { reason: String },
    #[error("gateway timed out")]
    Timeout,
    #[error("transient gateway error: {0}")]
    Transient(String),
    #[error("unexpected gateway response: {0}")]
    Protocol(String),
}

/// The wire client. Implementations own transport; this crate owns
/// policy and state.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<GatewayIntent, GatewayError>;

    async fn refund(&self, intent_id: &str, amount: Money) -> Result<(), GatewayError>;
}

/// An asynchronous gateway callback, at-least-once, possibly duplicated
/// or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayEvent {
    pub event_id: String,
    pub intent_id: String,
    #[serde(flatten)]
    pub kind: GatewayEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEventKind {
    Succeeded,
    RequiresAction { action_token: String },
    Failed { reason: String },
    Disputed { reason: String },
}

/// What reconciliation did with an event. Every variant is a success
/// from the gateway's point of view; retries must not cascade.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Payment completed, order confirmed.
    Confirmed,
    /// Event already applied; nothing re-ran.
    DuplicateDelivery,
    /// Intent unknown to this system; logged and ignored.
    UnknownIntent,
    /// 3-D-Secure style continuation; no state change.
    ActionRequired { action_token: String },
    /// Payment failed, order moved, stock released.
    FailedApplied,
    /// Dispute recorded.
    DisputeApplied,
    /// The order was not in the event's source state (e.g. cancelled
    /// before confirmation arrived). State untouched, ops alerted when
    /// money is involved.
    GuardedNoOp,
}

/// The adapter.
pub struct PaymentGateway {
    store: Store,
    client: Arc<dyn GatewayClient>,
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    ledger: InventoryLedger,
}

impl PaymentGateway {
    pub fn new(
        store: Store,
        client: Arc<dyn GatewayClient>,
        config: GatewayConfig,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        ledger: InventoryLedger,
    ) -> Self {
        Self {
            store,
            client,
            config,
            clock,
            dispatcher,
            ledger,
        }
    }

    /// Create (or find) the payment intent for an order.
    ///
    /// Idempotent twice over: an existing Payment row for the order is
    /// returned as-is, and the gateway call itself is keyed by order
    /// number. Called strictly after the checkout transaction has
    /// committed — never while locks are held.
    pub async fn create_intent(&self, order: &Order) -> Result<Payment, CheckoutError> {
        if let Some(existing) = self.store.payment_for_order(&order.id) {
            return Ok(existing);
        }

        let request = CreateIntentRequest {
            idempotency_key: order.order_number.clone(),
            amount: order.totals.total_amount,
        };
        let intent = self.call_create(&request).await?;

        let now = self.clock.now();
        let payment = Payment::pending(
            order.id.clone(),
            intent.intent_id.clone(),
            order.totals.total_amount,
            Some(intent.client_secret),
            now,
        );
        let mut tx = self.store.begin();
        match payments::insert(&mut tx, payment.clone()) {
            Ok(()) => {
                tx.commit()?;
                tracing::info!(order_number = %order.order_number, intent = %payment.intent_id, "payment intent created");
                Ok(payment)
            }
            Err(StoreError::DuplicateKey { .. }) => {
                // A concurrent attempt persisted the same intent first.
                drop(tx);
                self.store
                    .payment_by_intent(&intent.intent_id)
                    .or_else(|| self.store.payment_for_order(&order.id))
                    .ok_or_else(|| CheckoutError::NotFound(intent.intent_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one webhook event against payment and order state.
    pub fn reconcile(&self, event: &GatewayEvent) -> Result<ReconcileOutcome, CheckoutError> {
        let now = self.clock.now();
        let mut tx = self.store.begin();
        let Some(mut payment) = payments::find_by_intent_for_update(&mut tx, &event.intent_id)?
        else {
            // Not ours. Answer success so the gateway stops retrying.
            tracing::info!(intent = %event.intent_id, "webhook for unknown intent ignored");
            return Ok(ReconcileOutcome::UnknownIntent);
        };

        match &event.kind {
            GatewayEventKind::Succeeded => {
                if payment.status == PaymentStatus::Completed {
                    tracing::debug!(intent = %event.intent_id, "duplicate success delivery");
                    return Ok(ReconcileOutcome::DuplicateDelivery);
                }
                payment.status = PaymentStatus::Completed;
                payment.updated_at = now;
                payments::put(&mut tx, payment.clone())?;

                let mut order = orders::get_for_update(&mut tx, &payment.order_id)?;
                match order.apply(OrderEvent::PaymentSucceeded, now) {
                    Ok(_) => {
                        order.set_payment_status(PaymentStatus::Completed, now);
                        orders::put(&mut tx, order.clone())?;
                        tx.commit()?;
                        self.dispatcher.notify(NotificationEvent::OrderConfirmed {
                            order_id: order.id.clone(),
                            order_number: order.order_number.clone(),
                        });
                        Ok(ReconcileOutcome::Confirmed)
                    }
                    Err(CommerceError::InvalidTransition { from, .. }) => {
                        // Money moved for an order the business already
                        // settled another way (most often a cancel that
                        // won the race). Keep the payment fact, leave
                        // the order alone, and wake a human.
                        tx.commit()?;
                        self.dispatcher.notify(NotificationEvent::OpsAlert {
                            message: format!(
                                "payment {} completed but order {} is {from}; manual refund may be required",
                                payment.intent_id, order.order_number
                            ),
                            order_id: Some(order.id.clone()),
                        });
                        Ok(ReconcileOutcome::GuardedNoOp)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            GatewayEventKind::RequiresAction { action_token } => {
                // Continuation flows change nothing server-side.
                tx.rollback();
                Ok(ReconcileOutcome::ActionRequired {
                    action_token: action_token.clone(),
                })
            }
            GatewayEventKind::Failed { reason } => {
                if matches!(
                    payment.status,
                    PaymentStatus::Completed | PaymentStatus::Failed
                ) {
                    // A failure after success is a stale delivery, and a
                    // repeated failure already ran its side effects.
                    tracing::debug!(intent = %event.intent_id, status = payment.status.as_str(), "stale failure delivery ignored");
                    return Ok(ReconcileOutcome::DuplicateDelivery);
                }
                payment.status = PaymentStatus::Failed;
                payment.updated_at = now;
                payments::put(&mut tx, payment.clone())?;

                let mut order = orders::get_for_update(&mut tx, &payment.order_id)?;
                match order.apply(OrderEvent::PaymentFailed, now) {
                    Ok(_) => {
                        order.set_payment_status(PaymentStatus::Failed, now);
                        let mut items = order.items.clone();
                        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));
                        let mut released = Vec::new();
                        for item in &items {
                            if let Some(movement) = self.ledger.release(
                                &mut tx,
                                &item.product_id,
                                item.quantity,
                                &order.id,
                            )? {
                                released.push(movement);
                            }
                        }
                        orders::put(&mut tx, order.clone())?;
                        tx.commit()?;
                        self.ledger.publish_stock_events(
                            &self.store,
                            &released,
                            self.dispatcher.as_ref(),
                        );
                        self.dispatcher.notify(NotificationEvent::PaymentFailed {
                            order_id: order.id.clone(),
                            order_number: order.order_number.clone(),
                            reason: reason.clone(),
                        });
                        Ok(ReconcileOutcome::FailedApplied)
                    }
                    Err(CommerceError::InvalidTransition { .. }) => {
                        // Order already settled (e.g. cancelled, stock
                        // already back). Record the payment fact only.
                        tx.commit()?;
                        Ok(ReconcileOutcome::GuardedNoOp)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            GatewayEventKind::Disputed { reason } => {
                if payment.status == PaymentStatus::Disputed {
                    return Ok(ReconcileOutcome::DuplicateDelivery);
                }
                payment.status = PaymentStatus::Disputed;
                payment.updated_at = now;
                payments::put(&mut tx, payment.clone())?;

                let mut order = orders::get_for_update(&mut tx, &payment.order_id)?;
                let outcome = match order.apply(OrderEvent::Dispute, now) {
                    Ok(_) => {
                        order.set_payment_status(PaymentStatus::Disputed, now);
                        orders::put(&mut tx, order.clone())?;
                        ReconcileOutcome::DisputeApplied
                    }
                    Err(CommerceError::InvalidTransition { .. }) => ReconcileOutcome::GuardedNoOp,
                    Err(e) => return Err(e.into()),
                };
                tx.commit()?;
                self.dispatcher.notify(NotificationEvent::OpsAlert {
                    message: format!(
                        "dispute opened on {} ({reason}); manual resolution required",
                        payment.intent_id
                    ),
                    order_id: Some(payment.order_id.clone()),
                });
                Ok(outcome)
            }
        }
    }

    /// Refund a completed payment, fully (amount omitted) or partially.
    ///
    /// Refunds are additive into `refunded_amount` and capped at the
    /// paid amount. The gateway call happens before any state is
    /// touched and never under locks.
    pub async fn refund(
        &self,
        payment_id: &PaymentId,
        amount: Option<Money>,
    ) -> Result<Payment, CheckoutError> {
        let payment = self
            .store
            .payment(payment_id)
            .ok_or_else(|| CheckoutError::NotFound(payment_id.to_string()))?;
        if !matches!(
            payment.status,
            PaymentStatus::Completed | PaymentStatus::PartiallyRefunded
        ) {
            return Err(CheckoutError::InvalidTransition {
                from: payment.status.as_str().to_string(),
                event: "refund".to_string(),
            });
        }
        let refundable = payment.refundable();
        let requested = amount.unwrap_or(refundable).min(&refundable);
        if !requested.is_positive() {
            return Err(CommerceError::InvalidQuantity(requested.amount_cents).into());
        }

        self.call_refund(&payment.intent_id, requested).await?;

        let now = self.clock.now();
        let mut tx = self.store.begin();
        let mut payment = payments::get_for_update(&mut tx, payment_id)?;
        // Re-clamp under the lock; a concurrent refund may have landed.
        let applied = requested.min(&payment.refundable());
        payment.refunded_amount = payment.refunded_amount + applied;
        let full = payment.refunded_amount.amount_cents >= payment.amount.amount_cents;
        payment.status = if full {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        payment.updated_at = now;
        payments::put(&mut tx, payment.clone())?;

        let mut order = orders::get_for_update(&mut tx, &payment.order_id)?;
        if full {
            // Full refund retires the order; partial leaves fulfillment
            // where it is.
            if order.apply(OrderEvent::Refund, now).is_ok() {
                order.set_payment_status(PaymentStatus::Refunded, now);
            }
        } else {
            order.set_payment_status(PaymentStatus::PartiallyRefunded, now);
        }
        orders::put(&mut tx, order)?;
        tx.commit()?;

        tracing::info!(intent = %payment.intent_id, amount = %applied, full, "refund applied");
        Ok(payment)
    }

    async fn call_create(&self, request: &CreateIntentRequest) -> Result<GatewayIntent, CheckoutError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(
                self.config.timeout.total(),
                self.client.create_intent(request),
            )
            .await;
            match outcome {
                Ok(Ok(intent)) => return Ok(intent),
                Ok(Err(GatewayError::Declined { reason })) => {
                    return Err(CheckoutError::PaymentDeclined { reason })
                }
                // A timeout is an ambiguous outcome: the charge may
                // have landed. Leave the order pending for the webhook.
                Ok(Err(GatewayError::Timeout)) | Err(_) => {
                    return Err(CheckoutError::GatewayTimeout)
                }
                Ok(Err(GatewayError::Protocol(message))) => {
                    tracing::error!(message, "unexpected gateway response");
                    return Err(CheckoutError::GatewayTimeout);
                }
                Ok(Err(GatewayError::Transient(message))) => {
                    if !self.config.retry.should_retry(attempt) {
                        tracing::warn!(message, attempt, "gateway retries exhausted");
                        return Err(CheckoutError::GatewayTimeout);
                    }
                    tokio::time::sleep(self.config.retry.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn call_refund(&self, intent_id: &str, amount: Money) -> Result<(), CheckoutError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(
                self.config.timeout.total(),
                self.client.refund(intent_id, amount),
            )
            .await;
            match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(GatewayError::Declined { reason })) => {
                    return Err(CheckoutError::PaymentDeclined { reason })
                }
                Ok(Err(GatewayError::Timeout)) | Err(_) => {
                    return Err(CheckoutError::GatewayTimeout)
                }
                Ok(Err(GatewayError::Protocol(message))) => {
                    tracing::error!(message, "unexpected gateway response");
                    return Err(CheckoutError::GatewayTimeout);
                }
                Ok(Err(GatewayError::Transient(message))) => {
                    if !self.config.retry.should_retry(attempt) {
                        tracing::warn!(message, attempt, "gateway retries exhausted");
                        return Err(CheckoutError::GatewayTimeout);
                    }
                    tokio::time::sleep(self.config.retry.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// In-process gateway client for tests and local development.
///
/// Derives the intent id from the idempotency key, which mirrors how
/// the adapter achieves create-intent idempotency against a real
/// processor.
pub struct StaticGatewayClient {
    behavior: std::sync::Mutex<StaticGatewayBehavior>,
    calls: std::sync::atomic::AtomicU32,
}

/// How the static client answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticGatewayBehavior {
    Succeed,
    Decline,
    Timeout,
    Transient,
}

impl StaticGatewayClient {
    pub fn succeeding() -> Self {
        Self::with_behavior(StaticGatewayBehavior::Succeed)
    }

    pub fn with_behavior(behavior: StaticGatewayBehavior) -> Self {
        Self {
            behavior: std::sync::Mutex::new(behavior),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: StaticGatewayBehavior) {
        *self.behavior.lock().expect("client poisoned") = behavior;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn answer(&self) -> Result<(), GatewayError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match *self.behavior.lock().expect("client poisoned") {
            StaticGatewayBehavior::Succeed => Ok(()),
            StaticGatewayBehavior::Decline => Err(GatewayError::Declined {
                reason: "card_declined".to_string(),
            }),
            StaticGatewayBehavior::Timeout => Err(GatewayError::Timeout),
            StaticGatewayBehavior::Transient => {
                Err(GatewayError::Transient("upstream 503".to_string()))
            }
        }
    }
}

#[async_trait]
impl GatewayClient for StaticGatewayClient {
    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<GatewayIntent, GatewayError> {
        self.answer()?;
        Ok(GatewayIntent {
            intent_id: format!("pi_{}", request.idempotency_key),
            client_secret: format!("cs_{}", request.idempotency_key),
        })
    }

    async fn refund(&self, _intent_id: &str, _amount: Money) -> Result<(), GatewayError> {
        self.answer()
    }
}
