//! Payment provider webhook receiver
//!
//! Events are authenticated with the provider's signature header before the
//! body is parsed. Only payment intent outcomes change state; everything else
//! is acknowledged and ignored so the provider stops retrying.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{PaymentStatus, Purchase, StatusChange};
use crate::payments::{PaymentIntent, WebhookVerifier};

/// Where verified webhook outcomes are applied
#[async_trait]
pub trait PaymentStatusUpdater: Send + Sync {
    async fn update_payment_status(
        &self,
        purchase_id: Uuid,
        change: StatusChange,
    ) -> ApiResult<Purchase>;
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

/// What happened to an authenticated event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Ignored,
}

fn status_for_event(event_type: &str) -> Option<PaymentStatus> {
    match event_type {
        "payment_intent.succeeded" => Some(PaymentStatus::Paid),
        "payment_intent.payment_failed" => Some(PaymentStatus::Failed),
        "payment_intent.canceled" => Some(PaymentStatus::Cancelled),
        _ => None,
    }
}

pub struct WebhookReceiver {
    verifier: WebhookVerifier,
    updater: Arc<dyn PaymentStatusUpdater>,
    provider: &'static str,
}

impl WebhookReceiver {
    pub fn new(
        verifier: WebhookVerifier,
        updater: Arc<dyn PaymentStatusUpdater>,
        provider: &'static str,
    ) -> Self {
        Self {
            verifier,
            updater,
            provider,
        }
    }

    /// Verify and apply one delivery.
    ///
    /// Signature failures are errors. Events that cannot be tied to a
    /// purchase, or whose transition is stale, are ignored. Storage failures
    /// propagate so the provider redelivers.
    pub async fn handle(&self, signature: Option<&str>, payload: &[u8]) -> ApiResult<WebhookOutcome> {
        self.verifier
            .verify(payload, signature, Utc::now().timestamp())?;

        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| ApiError::Validation(format!("Malformed webhook event: {e}")))?;

        let Some(status) = status_for_event(&event.event_type) else {
            debug!(event_id = %event.id, event_type = %event.event_type, "Ignoring webhook event");
            return Ok(WebhookOutcome::Ignored);
        };

        let intent: PaymentIntent = match serde_json::from_value(event.data.object) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(event_id = %event.id, "Webhook event carries no payment intent: {}", e);
                return Ok(WebhookOutcome::Ignored);
            }
        };

        let Some(purchase_id) = intent
            .purchase_id()
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            warn!(event_id = %event.id, intent_id = %intent.id, "Payment intent has no purchase metadata");
            return Ok(WebhookOutcome::Ignored);
        };

        let change = StatusChange {
            to: status,
            payment_method: Some(self.provider.to_string()),
            transaction_id: Some(intent.id.clone()),
        };

        match self.updater.update_payment_status(purchase_id, change).await {
            Ok(purchase) => {
                info!(
                    event_id = %event.id,
                    %purchase_id,
                    status = %purchase.payment_status,
                    "Webhook applied"
                );
                Ok(WebhookOutcome::Processed)
            }
            Err(ApiError::NotFound(_)) => {
                warn!(event_id = %event.id, %purchase_id, "Webhook references unknown purchase");
                Ok(WebhookOutcome::Ignored)
            }
            Err(ApiError::InvalidTransition { from, to }) => {
                info!(event_id = %event.id, %purchase_id, %from, %to, "Stale webhook ignored");
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::templates::CREDENTIALS_SUBJECT;
    use crate::payments::{SignatureError, signature_header};
    use crate::testing::TestHarness;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SECRET: &str = "whsec_test";

    struct CountingUpdater {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentStatusUpdater for CountingUpdater {
        async fn update_payment_status(
            &self,
            _purchase_id: Uuid,
            _change: StatusChange,
        ) -> ApiResult<Purchase> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::NotFound("Purchase not found".to_string()))
        }
    }

    fn receiver(updater: Arc<dyn PaymentStatusUpdater>) -> WebhookReceiver {
        WebhookReceiver::new(
            WebhookVerifier::new(SECRET, Duration::from_secs(300)),
            updater,
            "stripe",
        )
    }

    fn event(event_type: &str, purchase_id: Uuid) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": event_type,
            "data": {
                "object": {
                    "id": "pi_123",
                    "amount": 4999,
                    "currency": "usd",
                    "status": "succeeded",
                    "metadata": { "purchase_id": purchase_id.to_string() }
                }
            }
        }))
        .unwrap()
    }

    fn sign(payload: &[u8]) -> String {
        signature_header(SECRET, Utc::now().timestamp(), payload)
    }

    #[tokio::test]
    async fn test_invalid_signature_touches_nothing() {
        let updater = Arc::new(CountingUpdater {
            calls: AtomicUsize::new(0),
        });
        let receiver = receiver(updater.clone());
        let payload = event("payment_intent.succeeded", Uuid::new_v4());

        let forged = signature_header("whsec_other", Utc::now().timestamp(), &payload);
        let err = receiver.handle(Some(&forged), &payload).await.unwrap_err();
        assert!(matches!(err, ApiError::Signature(SignatureError::Mismatch)));
        assert_eq!(err.status_code().as_u16(), 400);

        let missing = receiver.handle(None, &payload).await.unwrap_err();
        assert!(matches!(
            missing,
            ApiError::Signature(SignatureError::MissingHeader)
        ));

        assert_eq!(updater.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unrelated_event_is_ignored() {
        let updater = Arc::new(CountingUpdater {
            calls: AtomicUsize::new(0),
        });
        let receiver = receiver(updater.clone());
        let payload = event("customer.created", Uuid::new_v4());

        let outcome = receiver.handle(Some(&sign(&payload)), &payload).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(updater.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_metadata_is_ignored() {
        let updater = Arc::new(CountingUpdater {
            calls: AtomicUsize::new(0),
        });
        let receiver = receiver(updater.clone());
        let payload = serde_json::to_vec(&json!({
            "id": "evt_2",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_1", "amount": 100, "currency": "usd", "status": "succeeded" } }
        }))
        .unwrap();

        let outcome = receiver.handle(Some(&sign(&payload)), &payload).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(updater.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_purchase_is_acknowledged() {
        let updater = Arc::new(CountingUpdater {
            calls: AtomicUsize::new(0),
        });
        let receiver = receiver(updater.clone());
        let payload = event("payment_intent.succeeded", Uuid::new_v4());

        let outcome = receiver.handle(Some(&sign(&payload)), &payload).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeded_event_pays_and_fulfills_once() {
        let h = TestHarness::new();
        let course = h.catalog.add_course("Paint Correction", dec!(49.99), true);
        let purchase = h.purchase(&course, "new@x.com").await;
        let receiver = receiver(h.service.clone());
        let payload = event("payment_intent.succeeded", purchase.id);

        for _ in 0..2 {
            let outcome = receiver.handle(Some(&sign(&payload)), &payload).await.unwrap();
            assert_eq!(outcome, WebhookOutcome::Processed);
        }

        let stored = h.service.get_purchase(purchase.id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(stored.transaction_id.as_deref(), Some("pi_123"));
        assert_eq!(stored.payment_method.as_deref(), Some("stripe"));
        assert_eq!(h.users.all().len(), 1);
        assert_eq!(h.notifier.count_with_subject(CREDENTIALS_SUBJECT), 1);
    }

    #[tokio::test]
    async fn test_stale_failure_after_payment_is_ignored() {
        let h = TestHarness::new();
        let course = h.catalog.add_course("Paint Correction", dec!(49.99), true);
        let purchase = h.purchase(&course, "new@x.com").await;
        let receiver = receiver(h.service.clone());

        let paid = event("payment_intent.succeeded", purchase.id);
        receiver.handle(Some(&sign(&paid)), &paid).await.unwrap();

        let failed = event("payment_intent.payment_failed", purchase.id);
        let outcome = receiver.handle(Some(&sign(&failed)), &failed).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);

        let stored = h.service.get_purchase(purchase.id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_storage_failure_is_retryable() {
        let h = TestHarness::new();
        let course = h.catalog.add_course("Paint Correction", dec!(49.99), true);
        let purchase = h.purchase(&course, "new@x.com").await;
        h.purchases.fail_transitions();
        let receiver = receiver(h.service.clone());
        let payload = event("payment_intent.succeeded", purchase.id);

        let err = receiver.handle(Some(&sign(&payload)), &payload).await.unwrap_err();
        assert!(err.status_code().is_server_error());
    }
}
