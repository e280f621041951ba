//! Notification dispatch.
//!
//! Fire-and-forget: dispatch happens after the owning transaction has
//! committed, and a failing dispatcher never unwinds order state.
//! Implementations that talk to real channels should swallow and log
//! their own errors.

use serde::Serialize;
use std::sync::Mutex;
use till_commerce::ids::{OrderId, ProductId};
use till_commerce::money::Money;

/// Events the pipeline announces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    OrderCreated {
        order_id: OrderId,
        order_number: String,
        total: Money,
    },
    OrderConfirmed {
        order_id: OrderId,
        order_number: String,
    },
    OrderCancelled {
        order_id: OrderId,
        order_number: String,
    },
    PaymentFailed {
        order_id: OrderId,
        order_number: String,
        reason: String,
    },
    BackInStock {
        product_id: ProductId,
        stock: i64,
    },
    LowStock {
        product_id: ProductId,
        stock: i64,
    },
    OutOfStock {
        product_id: ProductId,
    },
    /// Something needs a human: e.g. a payment confirmed an order the
    /// business already cancelled.
    OpsAlert {
        message: String,
        order_id: Option<OrderId>,
    },
}

/// Fire-and-forget notification sink.
pub trait NotificationDispatcher: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

/// Default dispatcher: structured log lines only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

impl NotificationDispatcher for LogDispatcher {
    fn notify(&self, event: NotificationEvent) {
        match &event {
            NotificationEvent::OpsAlert { message, order_id } => {
                tracing::warn!(?order_id, message, "ops alert");
            }
            other => {
                tracing::info!(event = ?other, "notification");
            }
        }
    }
}

/// Collects events for assertions. Test use.
#[derive(Debug, Default)]
pub struct CollectingDispatcher {
    events: Mutex<Vec<NotificationEvent>>,
}

impl CollectingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().expect("dispatcher poisoned").clone()
    }

    pub fn count_matching(&self, predicate: impl Fn(&NotificationEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl NotificationDispatcher for CollectingDispatcher {
    fn notify(&self, event: NotificationEvent) {
        self.events.lock().expect("dispatcher poisoned").push(event);
    }
}
