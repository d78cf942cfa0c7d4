//! Application state shared across handlers

use common::jwt::JwtService;
use std::sync::Arc;

use crate::{purchases::PurchaseService, webhook::WebhookReceiver};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub purchases: Arc<PurchaseService>,
    pub webhooks: Arc<WebhookReceiver>,
    pub jwt_service: Arc<JwtService>,
}
