//! Service configuration read from the environment

use anyhow::Result;
use std::env;
use std::time::Duration;

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl ServerConfig {
    /// - `API_BIND_ADDR`: listen address (default: 0.0.0.0:3001)
    pub fn from_env() -> Self {
        Self {
            bind_addr: var_or("API_BIND_ADDR", "0.0.0.0:3001"),
        }
    }
}

/// Stripe credentials and client settings
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub timeout: Duration,
    pub webhook_tolerance: Duration,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .field("webhook_tolerance", &self.webhook_tolerance)
            .finish_non_exhaustive()
    }
}

impl StripeConfig {
    /// Create a new StripeConfig from environment variables
    ///
    /// # Environment Variables
    /// - `STRIPE_SECRET_KEY`: API secret key (required)
    /// - `STRIPE_WEBHOOK_SECRET`: webhook signing secret (required)
    /// - `STRIPE_API_BASE`: API base URL (default: https://api.stripe.com)
    /// - `STRIPE_TIMEOUT_SECONDS`: request timeout (default: 15)
    /// - `STRIPE_WEBHOOK_TOLERANCE_SECONDS`: accepted signature age (default: 300)
    pub fn from_env() -> Result<Self> {
        let secret_key = env::var("STRIPE_SECRET_KEY")
            .map_err(|_| anyhow::anyhow!("STRIPE_SECRET_KEY environment variable not set"))?;
        let webhook_secret = env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| anyhow::anyhow!("STRIPE_WEBHOOK_SECRET environment variable not set"))?;

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base: var_or("STRIPE_API_BASE", "https://api.stripe.com"),
            timeout: Duration::from_secs(parsed_or("STRIPE_TIMEOUT_SECONDS", 15)),
            webhook_tolerance: Duration::from_secs(parsed_or(
                "STRIPE_WEBHOOK_TOLERANCE_SECONDS",
                300,
            )),
        })
    }
}

/// SMTP settings for outbound mail
#[derive(Clone)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_email: String,
    pub from_name: String,
}

impl std::fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("from_email", &self.from_email)
            .finish_non_exhaustive()
    }
}

impl MailConfig {
    /// Read SMTP settings; `Ok(None)` when `SMTP_HOST` is unset.
    ///
    /// # Environment Variables
    /// - `SMTP_HOST`, `SMTP_PORT` (default: 587)
    /// - `SMTP_USERNAME`, `SMTP_PASSWORD` (required with a host)
    /// - `MAIL_FROM_EMAIL` (required with a host), `MAIL_FROM_NAME`
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(smtp_host) = env::var("SMTP_HOST") else {
            return Ok(None);
        };

        let smtp_username = env::var("SMTP_USERNAME")
            .map_err(|_| anyhow::anyhow!("SMTP_USERNAME must be set when SMTP_HOST is set"))?;
        let smtp_password = env::var("SMTP_PASSWORD")
            .map_err(|_| anyhow::anyhow!("SMTP_PASSWORD must be set when SMTP_HOST is set"))?;
        let from_email = env::var("MAIL_FROM_EMAIL")
            .map_err(|_| anyhow::anyhow!("MAIL_FROM_EMAIL must be set when SMTP_HOST is set"))?;

        Ok(Some(Self {
            smtp_host,
            smtp_port: parsed_or("SMTP_PORT", 587),
            smtp_username,
            smtp_password,
            from_email,
            from_name: var_or("MAIL_FROM_NAME", "Detailers University"),
        }))
    }
}

/// Purchase workflow settings
#[derive(Debug, Clone)]
pub struct PurchaseConfig {
    /// Link included in credential emails
    pub login_url: String,
    /// How long a fulfillment claim blocks other workers
    pub fulfillment_lease: Duration,
    /// Upper bound on a single notification attempt
    pub mail_timeout: Duration,
    /// Cron expression for the reconciliation job
    pub reconcile_schedule: String,
    /// Purchases retried per reconciliation run
    pub reconcile_batch_size: i64,
    /// Instructor/staff inbox told about each completed sale
    pub sales_notification_email: Option<String>,
}

impl Default for PurchaseConfig {
    fn default() -> Self {
        Self {
            login_url: "http://localhost:3000/login".to_string(),
            fulfillment_lease: Duration::from_secs(300),
            mail_timeout: Duration::from_secs(10),
            reconcile_schedule: "0 */5 * * * *".to_string(),
            reconcile_batch_size: 50,
            sales_notification_email: None,
        }
    }
}

impl PurchaseConfig {
    /// # Environment Variables
    /// - `PLATFORM_LOGIN_URL` (default: http://localhost:3000/login)
    /// - `FULFILLMENT_LEASE_SECONDS` (default: 300)
    /// - `MAIL_TIMEOUT_SECONDS` (default: 10)
    /// - `RECONCILE_SCHEDULE` (default: every 5 minutes)
    /// - `RECONCILE_BATCH_SIZE` (default: 50)
    /// - `SALES_NOTIFICATION_EMAIL` (optional)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            login_url: var_or("PLATFORM_LOGIN_URL", &defaults.login_url),
            fulfillment_lease: Duration::from_secs(parsed_or(
                "FULFILLMENT_LEASE_SECONDS",
                defaults.fulfillment_lease.as_secs(),
            )),
            mail_timeout: Duration::from_secs(parsed_or(
                "MAIL_TIMEOUT_SECONDS",
                defaults.mail_timeout.as_secs(),
            )),
            reconcile_schedule: var_or("RECONCILE_SCHEDULE", &defaults.reconcile_schedule),
            reconcile_batch_size: parsed_or("RECONCILE_BATCH_SIZE", defaults.reconcile_batch_size),
            sales_notification_email: env::var("SALES_NOTIFICATION_EMAIL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }
}
