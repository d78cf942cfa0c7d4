//! API service routes

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
};
use common::jwt::Claims;
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    error::{ApiError, ApiResult},
    middleware::{auth_middleware, require_admin},
    models::{
        CreatePaymentIntentRequest, CreatePurchaseRequest, ListPurchasesQuery, PaymentStatus,
        StatusChange, SyncPaymentRequest, UpdatePaymentStatusRequest,
    },
    purchases::parse_id,
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Success envelope mirroring the error body
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

/// Create the router for the API service
pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/guest-course-purchases", post(create_purchase))
        .route(
            "/guest-course-purchases/create-payment-intent",
            post(create_payment_intent),
        )
        .route(
            "/guest-course-purchases/access/:access_code",
            get(get_access),
        )
        .route(
            "/guest-course-purchases/:purchase_id/sync-payment",
            post(sync_payment),
        )
        .route("/payments/webhook", post(payment_webhook));

    let authenticated_routes = Router::new()
        .route("/guest-course-purchases/my-courses", get(my_courses))
        .route(
            "/guest-course-purchases/email/:email",
            get(purchases_by_email),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let admin_routes = Router::new()
        .route("/guest-course-purchases", get(list_purchases))
        .route("/guest-course-purchases/stats", get(purchase_stats))
        .route(
            "/guest-course-purchases/:purchase_id",
            get(get_purchase).delete(delete_purchase),
        )
        .route(
            "/guest-course-purchases/:purchase_id/payment",
            put(update_payment_status),
        )
        .route(
            "/guest-course-purchases/:purchase_id/send-credentials",
            post(send_credentials),
        )
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(public_routes)
        .merge(authenticated_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "api-service"
    }))
}

/// Start a guest purchase
pub async fn create_purchase(
    State(state): State<AppState>,
    payload: Result<Json<CreatePurchaseRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(payload) = payload?;
    let purchase = state.purchases.create_purchase(payload).await?;
    Ok((StatusCode::CREATED, ok(purchase)))
}

pub async fn create_payment_intent(
    State(state): State<AppState>,
    payload: Result<Json<CreatePaymentIntentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(payload) = payload?;
    let intent = state.purchases.create_payment_intent(payload).await?;
    Ok(ok(intent))
}

/// Look up a purchase by its access code
pub async fn get_access(
    State(state): State<AppState>,
    Path(access_code): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let access = state
        .purchases
        .get_access(&access_code)
        .await?
        .ok_or_else(|| ApiError::NotFound("Invalid access code".to_string()))?;
    Ok(ok(access))
}

/// Pull the payment outcome from the provider
pub async fn sync_payment(
    State(state): State<AppState>,
    Path(purchase_id): Path<String>,
    payload: Result<Json<SyncPaymentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let purchase_id = parse_id(&purchase_id, "purchaseId")?;
    let Json(payload) = payload?;
    let purchase = state
        .purchases
        .sync_payment_status(purchase_id, payload)
        .await?;
    Ok(ok(purchase))
}

/// Provider webhook; the raw body is needed for signature verification
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    state.webhooks.handle(signature, &body).await?;
    Ok(Json(json!({ "received": true })))
}

/// Paid courses of the signed-in user
pub async fn my_courses(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let courses = state.purchases.my_purchased_courses(&claims).await?;
    Ok(ok(courses))
}

pub async fn purchases_by_email(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(email): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let purchases = state
        .purchases
        .list_purchases_for_email(&claims, &email)
        .await?;
    Ok(ok(purchases))
}

/// Paginated purchase listing for administrators
pub async fn list_purchases(
    State(state): State<AppState>,
    query: Result<Query<ListPurchasesQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query.map_err(|e| ApiError::Validation(e.body_text()))?;
    let page = state.purchases.list_purchases(query).await?;
    Ok(ok(page))
}

pub async fn purchase_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.purchases.stats().await?))
}

pub async fn get_purchase(
    State(state): State<AppState>,
    Path(purchase_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let purchase_id = parse_id(&purchase_id, "purchaseId")?;
    Ok(ok(state.purchases.get_purchase(purchase_id).await?))
}

pub async fn delete_purchase(
    State(state): State<AppState>,
    Path(purchase_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let purchase_id = parse_id(&purchase_id, "purchaseId")?;
    state.purchases.delete_purchase(purchase_id).await?;
    Ok(ok(json!({ "purchaseId": purchase_id })))
}

/// Manual status override
pub async fn update_payment_status(
    State(state): State<AppState>,
    Path(purchase_id): Path<String>,
    payload: Result<Json<UpdatePaymentStatusRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let purchase_id = parse_id(&purchase_id, "purchaseId")?;
    let Json(payload) = payload?;
    let to: PaymentStatus = payload
        .payment_status
        .trim()
        .to_ascii_uppercase()
        .parse()?;

    let purchase = state
        .purchases
        .update_payment_status(
            purchase_id,
            StatusChange {
                to,
                payment_method: payload.payment_method,
                transaction_id: payload.transaction_id,
            },
        )
        .await?;
    Ok(ok(purchase))
}

/// Reset the buyer's password and email it again
pub async fn send_credentials(
    State(state): State<AppState>,
    Path(purchase_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let purchase_id = parse_id(&purchase_id, "purchaseId")?;
    Ok(ok(state.purchases.resend_credentials(purchase_id).await?))
}
