//! Guest course purchase models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

use super::course::CourseSummary;

/// Payment lifecycle of a purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    Cancelled,
}

#[derive(Debug, Error)]
#[error("paymentStatus must be one of PENDING, PAID, FAILED, REFUNDED, CANCELLED (got {0:?})")]
pub struct InvalidPaymentStatus(pub String);

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 5] = [
        PaymentStatus::Pending,
        PaymentStatus::Paid,
        PaymentStatus::Failed,
        PaymentStatus::Refunded,
        PaymentStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Statuses a purchase may be in for a write of `self` to apply.
    ///
    /// Every status accepts itself so duplicate deliveries are no-ops.
    /// FAILED can still become PAID because the buyer may retry with
    /// another payment method on the same intent.
    pub fn allowed_predecessors(&self) -> &'static [PaymentStatus] {
        use PaymentStatus::*;
        match self {
            Pending => &[Pending],
            Paid => &[Pending, Failed, Paid],
            Failed => &[Pending, Failed],
            Cancelled => &[Pending, Failed, Cancelled],
            Refunded => &[Paid, Refunded],
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = InvalidPaymentStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| InvalidPaymentStatus(s.to_string()))
    }
}

/// Purchase entity
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    #[serde(rename = "purchaseId")]
    pub id: Uuid,
    pub course_id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<String>,
    pub transaction_id: Option<String>,
    pub access_code: String,
    pub user_id: Option<Uuid>,
    /// The linked account was created by this purchase and its password
    /// has not been handed over yet
    #[serde(skip_serializing)]
    pub credentials_pending: bool,
    #[serde(skip_serializing)]
    pub fulfillment_claimed_at: Option<DateTime<Utc>>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated purchase ready to insert
#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub id: Uuid,
    pub course_id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub access_code: String,
}

/// Requested status write
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub to: PaymentStatus,
    pub payment_method: Option<String>,
    pub transaction_id: Option<String>,
}

/// Result of a conditional status write
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The write applied; `previous` is the status it replaced
    Applied {
        purchase: Purchase,
        previous: PaymentStatus,
    },
    /// The current status does not allow the requested one
    Rejected { current: Purchase },
    NotFound,
}

/// Admin listing filter
#[derive(Debug, Clone, Default)]
pub struct PurchaseFilter {
    pub status: Option<PaymentStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// Purchase counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseStats {
    pub total: i64,
    pub pending: i64,
    pub paid: i64,
    pub failed: i64,
    pub refunded: i64,
    pub cancelled: i64,
    pub fulfilled: i64,
}

impl PurchaseStats {
    pub fn record(&mut self, status: PaymentStatus, count: i64) {
        self.total += count;
        match status {
            PaymentStatus::Pending => self.pending += count,
            PaymentStatus::Paid => self.paid += count,
            PaymentStatus::Failed => self.failed += count,
            PaymentStatus::Refunded => self.refunded += count,
            PaymentStatus::Cancelled => self.cancelled += count,
        }
    }
}

/// Purchase looked up by access code, with the course it unlocks
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseAccess {
    #[serde(flatten)]
    pub purchase: Purchase,
    pub course: Option<CourseSummary>,
    /// Whether the purchase currently grants access to the course
    pub has_access: bool,
}

/// Result of an admin credential resend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendCredentialsResponse {
    pub email: String,
    pub email_sent: bool,
}

/// A paid course as listed to its buyer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchasedCourse {
    pub purchase_id: Uuid,
    pub course_id: Uuid,
    pub course_title: String,
    pub access_code: String,
    pub purchased_at: DateTime<Utc>,
}

/// Body of `POST /guest-course-purchases`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePurchaseRequest {
    pub course_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
}

/// Body of `POST /guest-course-purchases/create-payment-intent`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentRequest {
    pub purchase_id: String,
}

/// Handle returned to the client to complete payment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    pub client_secret: Option<String>,
    pub payment_intent_id: String,
    pub amount: i64,
    pub currency: String,
}

/// Body of `PUT /guest-course-purchases/:purchaseId/payment`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePaymentStatusRequest {
    pub payment_status: String,
    pub payment_method: Option<String>,
    pub transaction_id: Option<String>,
}

/// Body of `POST /guest-course-purchases/:purchaseId/sync-payment`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPaymentRequest {
    pub payment_intent_id: String,
}

/// Query parameters for the admin listing
#[derive(Debug, Clone, Deserialize)]
pub struct ListPurchasesQuery {
    /// Page number (1-based)
    pub page: Option<u32>,
    /// Number of items per page
    pub limit: Option<u32>,
    /// Filter by payment status
    pub status: Option<String>,
}

/// Response for the admin listing with pagination
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseListResponse {
    pub items: Vec<Purchase>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
}
