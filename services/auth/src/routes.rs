//! Authentication service routes

use axum::{
    Extension, Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use common::{
    jwt::{Claims, TokenType},
    password::{hash_password, verify_password},
    users::User,
    validation::{normalize_email, validate_password},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{AppState, error::AuthError, middleware::auth_middleware};

/// Response for token generation
#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// Request for token refresh
#[derive(Deserialize)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

/// Request for user login
#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Create the router for the authentication service
pub fn create_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/auth/change-password", post(change_password))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh_token))
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "auth-service"
    }))
}

fn bad_json(rejection: JsonRejection) -> AuthError {
    AuthError::BadRequest(rejection.body_text())
}

/// Check a password on the blocking pool
async fn password_matches(password: String, password_hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &password_hash))
        .await
        .map_err(|e| {
            error!("Password verification task failed: {}", e);
            AuthError::InternalServerError
        })?
        .map_err(|e| {
            error!("Password verification failed: {}", e);
            AuthError::InternalServerError
        })
}

fn issue_tokens(state: &AppState, user: &User) -> Result<TokenResponse, AuthError> {
    let access_token = state
        .jwt_service
        .generate_access_token(user)
        .map_err(|e| {
            error!("Failed to generate access token: {}", e);
            AuthError::InternalServerError
        })?;

    let refresh_token = state
        .jwt_service
        .generate_refresh_token(user)
        .map_err(|e| {
            error!("Failed to generate refresh token: {}", e);
            AuthError::InternalServerError
        })?;

    Ok(TokenResponse {
        access_token,
        refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: state.jwt_service.access_token_expiry(),
    })
}

async fn load_user(state: &AppState, claims: &Claims) -> Result<User, AuthError> {
    let user = state
        .users
        .find_by_id(claims.sub)
        .await
        .map_err(|e| {
            error!("Failed to load user: {}", e);
            AuthError::InternalServerError
        })?
        .ok_or(AuthError::Unauthorized)?;

    if !user.is_active {
        return Err(AuthError::Unauthorized);
    }
    Ok(user)
}

/// User login endpoint
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(payload) = payload.map_err(bad_json)?;
    let email = normalize_email(&payload.email);

    let user = state
        .users
        .find_by_email(&email)
        .await
        .map_err(|e| {
            error!("Failed to look up user: {}", e);
            AuthError::InternalServerError
        })?
        .ok_or(AuthError::Unauthorized)?;

    if !password_matches(payload.password, user.password_hash.clone()).await? {
        warn!(user_id = %user.id, "Login failed: wrong password");
        return Err(AuthError::Unauthorized);
    }

    if !user.is_active {
        return Err(AuthError::Forbidden("Account is disabled".to_string()));
    }

    let response = issue_tokens(&state, &user)?;
    info!(user_id = %user.id, "User logged in");

    Ok((StatusCode::OK, Json(response)))
}

/// Refresh token endpoint; the refresh token is rotated on every use
pub async fn refresh_token(
    State(state): State<AppState>,
    payload: Result<Json<RefreshTokenRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(payload) = payload.map_err(bad_json)?;

    let claims = state
        .jwt_service
        .validate_token(&payload.refresh_token)
        .map_err(|_| AuthError::Unauthorized)?;

    // Check that it's actually a refresh token
    if claims.token_type != TokenType::Refresh {
        return Err(AuthError::Unauthorized);
    }

    let user = load_user(&state, &claims).await?;
    let response = issue_tokens(&state, &user)?;

    Ok((StatusCode::OK, Json(response)))
}

/// Replace the password of the signed-in user
pub async fn change_password(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(payload) = payload.map_err(bad_json)?;
    validate_password(&payload.new_password).map_err(AuthError::BadRequest)?;

    let user = load_user(&state, &claims).await?;
    if !password_matches(payload.current_password, user.password_hash.clone()).await? {
        return Err(AuthError::BadRequest(
            "Current password is incorrect".to_string(),
        ));
    }

    let new_password = payload.new_password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&new_password))
        .await
        .map_err(|e| {
            error!("Password hashing task failed: {}", e);
            AuthError::InternalServerError
        })?
        .map_err(|e| {
            error!("Password hashing failed: {}", e);
            AuthError::InternalServerError
        })?;

    state
        .users
        .update_password(user.id, &password_hash)
        .await
        .map_err(|e| {
            error!("Failed to update password: {}", e);
            AuthError::InternalServerError
        })?;

    info!(user_id = %user.id, "Password changed");
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({"message": "Password updated successfully"})),
    ))
}
