//! Stripe REST client

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    COURSE_ID_METADATA_KEY, GatewayError, PURCHASE_ID_METADATA_KEY, PaymentGateway, PaymentIntent,
    PaymentIntentRequest,
};
use crate::config::StripeConfig;

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Payment gateway backed by Stripe payment intents
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    secret_key: String,
    api_base: String,
}

impl StripeGateway {
    pub fn new(config: &StripeConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            secret_key: config.secret_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn parse_intent(response: Response) -> Result<PaymentIntent, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<PaymentIntent>()
                .await
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<StripeErrorBody>(&body) {
            Ok(parsed) => (
                parsed
                    .error
                    .code
                    .or(parsed.error.kind)
                    .unwrap_or_else(|| "unknown".to_string()),
                parsed.error.message.unwrap_or_default(),
            ),
            Err(_) => ("unknown".to_string(), body),
        };

        warn!(status = status.as_u16(), %code, "Stripe rejected request");
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Transport("request timed out".to_string())
    } else {
        GatewayError::Transport(err.to_string())
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider_name(&self) -> &'static str {
        "stripe"
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        let amount = request.amount.to_string();
        let purchase_id = request.purchase_id.to_string();
        let course_id = request.course_id.to_string();
        let purchase_key = format!("metadata[{PURCHASE_ID_METADATA_KEY}]");
        let course_key = format!("metadata[{COURSE_ID_METADATA_KEY}]");
        let form: [(&str, &str); 7] = [
            ("amount", &amount),
            ("currency", &request.currency),
            ("receipt_email", &request.receipt_email),
            ("description", &request.description),
            ("automatic_payment_methods[enabled]", "true"),
            (&purchase_key, &purchase_id),
            (&course_key, &course_id),
        ];

        debug!(purchase_id = %request.purchase_id, amount = request.amount, "Creating payment intent");

        // Retries for the same purchase and amount return the same intent
        let idempotency_key = format!("pi-{}-{}", request.purchase_id, request.amount);

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.api_base))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        Self::parse_intent(response).await
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        if intent_id.is_empty() || !intent_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(GatewayError::Rejected {
                status: 400,
                code: "invalid_intent_id".to_string(),
                message: "payment intent id is malformed".to_string(),
            });
        }

        let response = self
            .client
            .get(format!("{}/v1/payment_intents/{}", self.api_base, intent_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(transport_error)?;

        Self::parse_intent(response).await
    }
}
