//! Pipeline configuration.

use crate::policy::{RetryPolicy, TimeoutConfig};
use serde::{Deserialize, Serialize};

/// Gateway adapter tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Checkout pipeline configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckoutConfig {
    /// Stock at or below this opens a low-stock alert.
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: i64,
    /// Bounded attempts at a unique order number.
    #[serde(default = "default_order_number_attempts")]
    pub order_number_attempts: u32,
    /// Webhook timestamp tolerance in seconds.
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: i64,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_low_stock_threshold() -> i64 {
    5
}

fn default_order_number_attempts() -> u32 {
    8
}

fn default_webhook_tolerance_secs() -> i64 {
    300
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            low_stock_threshold: default_low_stock_threshold(),
            order_number_attempts: default_order_number_attempts(),
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl CheckoutConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
