//! Outbound email notifications

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

mod smtp;
pub mod templates;

pub use smtp::SmtpNotifier;

/// Rendered email
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

/// Delivery channel for transactional email
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// Notifier used when no SMTP relay is configured.
///
/// Records that a message would have been sent without logging its body,
/// which may contain a plaintext password.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        info!(to = %message.to, subject = %message.subject, "Email delivery disabled; message dropped");
        Ok(())
    }
}

/// Send `message`, logging instead of failing.
///
/// Returns whether the message was handed to the transport within `timeout`.
pub async fn send_best_effort(
    notifier: &dyn Notifier,
    message: &EmailMessage,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, notifier.send(message)).await {
        Ok(Ok(())) => {
            info!(to = %message.to, subject = %message.subject, "Email sent");
            true
        }
        Ok(Err(e)) => {
            warn!(to = %message.to, subject = %message.subject, "Email delivery failed: {:#}", e);
            false
        }
        Err(_) => {
            warn!(to = %message.to, subject = %message.subject, "Email delivery timed out");
            false
        }
    }
}
