//! Payment gateway abstraction
//!
//! The purchase workflow only needs two provider operations: creating a
//! payment intent for a purchase and reading one back. [`StripeGateway`]
//! implements them against the Stripe REST API.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::models::PaymentStatus;

mod signature;
mod stripe;

#[cfg(test)]
pub use signature::signature_header;
pub use signature::{SignatureError, WebhookVerifier};
pub use stripe::StripeGateway;

/// Metadata key linking a provider intent back to its purchase
pub const PURCHASE_ID_METADATA_KEY: &str = "purchase_id";

/// Metadata key carrying the course id, informational only
pub const COURSE_ID_METADATA_KEY: &str = "course_id";

/// Failures talking to the payment provider
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The provider answered with an error object
    #[error("provider rejected request ({status}, {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    /// The provider could not be reached or timed out
    #[error("provider unreachable: {0}")]
    Transport(String),

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Rejected { .. } => "PAYMENT_GATEWAY_REJECTED",
            GatewayError::Transport(_) => "PAYMENT_GATEWAY_UNAVAILABLE",
            GatewayError::InvalidResponse(_) => "PAYMENT_GATEWAY_ERROR",
        }
    }
}

/// Parameters for a new payment intent
#[derive(Debug, Clone)]
pub struct PaymentIntentRequest {
    /// Amount in minor units
    pub amount: i64,
    pub currency: String,
    pub purchase_id: Uuid,
    pub course_id: Uuid,
    pub receipt_email: String,
    pub description: String,
}

/// Provider-side status of an intent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Other,
}

/// Payment intent as returned by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentIntentStatus,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<serde_json::Value>,
}

impl PaymentIntent {
    /// Purchase id recorded in the intent metadata, if any
    pub fn purchase_id(&self) -> Option<&str> {
        self.metadata.get(PURCHASE_ID_METADATA_KEY).map(String::as_str)
    }

    /// Purchase status implied by a settled intent.
    ///
    /// Returns `None` while the intent is still in flight.
    pub fn settled_status(&self) -> Option<PaymentStatus> {
        match self.status {
            PaymentIntentStatus::Succeeded => Some(PaymentStatus::Paid),
            PaymentIntentStatus::Canceled => Some(PaymentStatus::Cancelled),
            PaymentIntentStatus::RequiresPaymentMethod if self.last_payment_error.is_some() => {
                Some(PaymentStatus::Failed)
            }
            _ => None,
        }
    }
}

/// Payment provider seam
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Short provider name recorded as the purchase's payment method
    fn provider_name(&self) -> &'static str;

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent(value: serde_json::Value) -> PaymentIntent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_settled_status() {
        let succeeded = intent(json!({
            "id": "pi_1", "amount": 4999, "currency": "usd", "status": "succeeded"
        }));
        assert_eq!(succeeded.settled_status(), Some(PaymentStatus::Paid));

        let canceled = intent(json!({
            "id": "pi_2", "amount": 4999, "currency": "usd", "status": "canceled"
        }));
        assert_eq!(canceled.settled_status(), Some(PaymentStatus::Cancelled));

        let declined = intent(json!({
            "id": "pi_3", "amount": 4999, "currency": "usd",
            "status": "requires_payment_method",
            "last_payment_error": { "code": "card_declined" }
        }));
        assert_eq!(declined.settled_status(), Some(PaymentStatus::Failed));

        let fresh = intent(json!({
            "id": "pi_4", "amount": 4999, "currency": "usd",
            "status": "requires_payment_method"
        }));
        assert_eq!(fresh.settled_status(), None);
    }

    #[test]
    fn test_unknown_status_does_not_fail_parsing() {
        let parsed = intent(json!({
            "id": "pi_5", "amount": 100, "currency": "usd", "status": "some_future_state",
            "metadata": { "purchase_id": "abc" }
        }));
        assert_eq!(parsed.status, PaymentIntentStatus::Other);
        assert_eq!(parsed.purchase_id(), Some("abc"));
        assert_eq!(parsed.settled_status(), None);
    }
}
