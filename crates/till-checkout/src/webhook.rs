//! Webhook boundary: signature verification and the receiver contract.
//!
//! The gateway signs the raw body with a shared secret; verification
//! failure rejects with zero state mutation. Status codes are chosen so
//! guarded no-ops read as success to the gateway — its retries must not
//! cascade into our state.

use crate::error::CheckoutError;
use crate::gateway::{GatewayEvent, PaymentGateway, ReconcileOutcome};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Duration;
use hmac::{Hmac, Mac};
use http::StatusCode;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use till_commerce::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme: `t=<unix seconds>,v1=<base64 hmac-sha256>` over
/// the payload `"{t}.{body}"`.
const SIGNATURE_VERSION: &str = "v1";

/// Signature rejection reasons. All of them are security events.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WebhookError {
    #[error("malformed signature header")]
    MalformedHeader,
    #[error("webhook timestamp outside tolerance")]
    StaleTimestamp,
    #[error("signature mismatch")]
    BadSignature,
}

/// Verifies (and, for tests and outbound use, produces) webhook
/// signatures.
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
    clock: Arc<dyn Clock>,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: Duration::seconds(tolerance_secs),
            clock,
        }
    }

    /// Produce a signature header for `body` at the given time.
    pub fn sign(&self, body: &[u8], at: chrono::DateTime<chrono::Utc>) -> String {
        let timestamp = at.timestamp();
        let mac = self.mac_for(timestamp, body);
        format!(
            "t={timestamp},{SIGNATURE_VERSION}={}",
            STANDARD.encode(mac.finalize().into_bytes())
        )
    }

    /// Check a signature header against the raw body.
    pub fn verify(&self, body: &[u8], header: &str) -> Result<(), WebhookError> {
        let mut timestamp = None;
        let mut signature = None;
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some((SIGNATURE_VERSION, value)) => {
                    signature = STANDARD.decode(value.as_bytes()).ok()
                }
                _ => {}
            }
        }
        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(s)) => (t, s),
            _ => return Err(WebhookError::MalformedHeader),
        };

        let age = self.clock.now().timestamp() - timestamp;
        if age.abs() > self.tolerance.num_seconds() {
            return Err(WebhookError::StaleTimestamp);
        }

        self.mac_for(timestamp, body)
            .verify_slice(&signature)
            .map_err(|_| WebhookError::BadSignature)
    }

    fn mac_for(&self, timestamp: i64, body: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac
    }
}

/// Receiver response: what to answer the gateway.
#[derive(Debug)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub outcome: Option<ReconcileOutcome>,
}

/// The HTTP-boundary receiver: verify, parse, reconcile.
pub struct WebhookReceiver {
    verifier: WebhookVerifier,
    gateway: Arc<PaymentGateway>,
}

impl WebhookReceiver {
    pub fn new(verifier: WebhookVerifier, gateway: Arc<PaymentGateway>) -> Self {
        Self { verifier, gateway }
    }

    pub fn handle(&self, body: &[u8], signature_header: &str) -> WebhookResponse {
        if let Err(e) = self.verifier.verify(body, signature_header) {
            tracing::warn!(error = %e, "webhook signature rejected");
            return WebhookResponse {
                status: StatusCode::BAD_REQUEST,
                outcome: None,
            };
        }

        let event: GatewayEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "webhook body unparseable");
                return WebhookResponse {
                    status: StatusCode::BAD_REQUEST,
                    outcome: None,
                };
            }
        };

        match self.gateway.reconcile(&event) {
            Ok(outcome) => WebhookResponse {
                status: StatusCode::OK,
                outcome: Some(outcome),
            },
            Err(CheckoutError::ConcurrencyConflict) => {
                // Transient; the gateway's retry will land cleanly
                // because reconciliation is idempotent.
                WebhookResponse {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    outcome: None,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, intent = %event.intent_id, "reconcile failed");
                WebhookResponse {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    outcome: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::StaticGatewayClient;
    use crate::ledger::InventoryLedger;
    use crate::notify::LogDispatcher;
    use till_commerce::clock::{ManualClock, SystemClock};
    use till_store::Store;

    fn verifier_at(now: chrono::DateTime<chrono::Utc>) -> (WebhookVerifier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(now));
        (
            WebhookVerifier::new(*b"whsec_test", 300, clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let now = chrono::Utc::now();
        let (verifier, _clock) = verifier_at(now);
        let body = br#"{"event_id":"evt_1"}"#;
        let header = verifier.sign(body, now);
        verifier.verify(body, &header).unwrap();
    }

    #[test]
    fn test_tampered_body_rejected() {
        let now = chrono::Utc::now();
        let (verifier, _clock) = verifier_at(now);
        let header = verifier.sign(br#"{"amount":100}"#, now);
        let err = verifier.verify(br#"{"amount":999}"#, &header).unwrap_err();
        assert_eq!(err, WebhookError::BadSignature);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = chrono::Utc::now();
        let (verifier, clock) = verifier_at(now);
        let body = b"{}";
        let header = verifier.sign(body, now);
        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(
            verifier.verify(body, &header).unwrap_err(),
            WebhookError::StaleTimestamp
        );
    }

    #[test]
    fn test_malformed_header_rejected() {
        let now = chrono::Utc::now();
        let (verifier, _clock) = verifier_at(now);
        assert_eq!(
            verifier.verify(b"{}", "nonsense").unwrap_err(),
            WebhookError::MalformedHeader
        );
    }

    #[test]
    fn test_unknown_intent_answers_ok() {
        let store = Store::default();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let gateway = Arc::new(PaymentGateway::new(
            store,
            Arc::new(StaticGatewayClient::succeeding()),
            GatewayConfig::default(),
            clock.clone(),
            Arc::new(LogDispatcher),
            InventoryLedger::new(5, clock.clone()),
        ));
        let receiver = WebhookReceiver::new(
            WebhookVerifier::new(*b"whsec_test", 300, clock.clone()),
            gateway,
        );

        let body = serde_json::to_vec(&GatewayEvent {
            event_id: "evt_1".to_string(),
            intent_id: "pi_unknown".to_string(),
            kind: crate::gateway::GatewayEventKind::Succeeded,
        })
        .unwrap();
        let header = WebhookVerifier::new(*b"whsec_test", 300, clock.clone())
            .sign(&body, clock.now());
        let response = receiver.handle(&body, &header);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.outcome, Some(ReconcileOutcome::UnknownIntent));

        // Bad signature: rejected, nothing touched.
        let response = receiver.handle(&body, "t=0,v1=AAAA");
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }
}
