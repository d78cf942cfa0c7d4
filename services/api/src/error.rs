//! Custom error types for the API service

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use common::error::DatabaseError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::models::{InvalidPaymentStatus, PaymentStatus};
use crate::payments::{GatewayError, SignatureError};

/// Closed set of failures surfaced by the API
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed or missing input
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Payment provider rejected the request or could not be reached
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Constraint violation not absorbed by the workflow
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid webhook signature: {0}")]
    Signature(#[from] SignatureError),

    /// Status write not allowed from the purchase's current status
    #[error("Cannot change payment status from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Duplicate(_) => StatusCode::CONFLICT,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Signature(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Gateway(e) => e.code(),
            ApiError::Duplicate(_) => "DUPLICATE",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Signature(_) => "INVALID_SIGNATURE",
            ApiError::InvalidTransition { .. } => "INVALID_STATUS_TRANSITION",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to return to the caller
    fn public_message(&self) -> String {
        match self {
            ApiError::Validation(msg)
            | ApiError::NotFound(msg)
            | ApiError::Duplicate(msg)
            | ApiError::Forbidden(msg) => msg.clone(),
            ApiError::Unauthorized => "Authentication required".to_string(),
            ApiError::Signature(_) => "Webhook signature verification failed".to_string(),
            ApiError::InvalidTransition { .. } => self.to_string(),
            ApiError::Gateway(_) => {
                "Payment could not be set up. Please try again later.".to_string()
            }
            ApiError::Database(_) | ApiError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::UniqueViolation { constraint } => {
                ApiError::Duplicate(format!("Record conflicts with an existing one ({constraint})"))
            }
            other => ApiError::Database(other),
        }
    }
}

impl From<InvalidPaymentStatus> for ApiError {
    fn from(err: InvalidPaymentStatus) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() || matches!(self, ApiError::Gateway(_)) {
            error!(code = self.code(), "Request failed: {}", self);
        } else if matches!(self, ApiError::Signature(_)) {
            warn!("Rejected webhook: {}", self);
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        }));

        (status, body).into_response()
    }
}

/// Type alias for API results
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_validation_envelope() {
        let (status, body) = body_json(ApiError::Validation("Email is required".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["message"], "Email is required");
    }

    #[tokio::test]
    async fn test_gateway_detail_is_not_echoed() {
        let err = ApiError::Gateway(GatewayError::Rejected {
            status: 401,
            code: "api_key_invalid".into(),
            message: "Invalid API Key provided: sk_live_****".into(),
        });
        let (status, body) = body_json(err).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "PAYMENT_GATEWAY_REJECTED");
        assert!(!body.to_string().contains("sk_live"));
    }

    #[tokio::test]
    async fn test_database_detail_is_not_echoed() {
        let err = ApiError::from(DatabaseError::Configuration("password=hunter2".into()));
        let (status, body) = body_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Internal server error");
    }

    #[test]
    fn test_unique_violation_maps_to_duplicate() {
        let err = ApiError::from(DatabaseError::UniqueViolation {
            constraint: "guest_course_purchases_access_code_key".into(),
        });
        assert!(matches!(err, ApiError::Duplicate(_)));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_invalid_status_maps_to_validation() {
        let err = ApiError::from("SETTLED".parse::<PaymentStatus>().unwrap_err());
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
