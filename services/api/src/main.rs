use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;
mod credentials;
mod error;
mod middleware;
mod models;
mod notifier;
mod payments;
mod purchases;
mod reconcile;
mod repositories;
mod routes;
mod state;
#[cfg(test)]
mod testing;
mod webhook;

use common::{
    database::{DatabaseConfig, health_check, init_pool, run_migrations},
    jwt::{JwtConfig, JwtService},
    users::UserRepository,
};
use tokio::net::TcpListener;

use crate::{
    config::{MailConfig, PurchaseConfig, ServerConfig, StripeConfig},
    credentials::CredentialIssuer,
    notifier::{LogNotifier, Notifier, SmtpNotifier},
    payments::{PaymentGateway, StripeGateway, WebhookVerifier},
    purchases::PurchaseService,
    repositories::{CourseRepository, PurchaseRepository},
    state::AppState,
    webhook::WebhookReceiver,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("setting default subscriber failed: {}", e))?;

    info!("Starting API service");

    // Initialize database connection pool
    let db_config = DatabaseConfig::from_env()?;
    let pool = init_pool(&db_config).await?;

    // Check database connectivity
    if health_check(&pool).await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }
    run_migrations(&pool).await?;

    // Tokens are issued by the auth service; only the public key is needed here
    let jwt_service = JwtService::new(JwtConfig::from_env(false)?)?;

    let stripe_config = StripeConfig::from_env()?;
    let gateway = Arc::new(StripeGateway::new(&stripe_config)?);
    let provider = gateway.provider_name();

    let notifier: Arc<dyn Notifier> = match MailConfig::from_env()? {
        Some(mail_config) => {
            info!(host = %mail_config.smtp_host, "SMTP delivery enabled");
            Arc::new(SmtpNotifier::new(&mail_config)?)
        }
        None => {
            warn!("SMTP_HOST not set; emails will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let purchase_config = PurchaseConfig::from_env();
    let reconcile_schedule = purchase_config.reconcile_schedule.clone();

    let purchases = Arc::new(PurchaseService::new(
        Arc::new(PurchaseRepository::new(pool.clone())),
        Arc::new(CourseRepository::new(pool.clone())),
        gateway,
        CredentialIssuer::new(Arc::new(UserRepository::new(pool.clone()))),
        notifier,
        purchase_config,
    ));

    let webhooks = Arc::new(WebhookReceiver::new(
        WebhookVerifier::new(
            stripe_config.webhook_secret.clone(),
            stripe_config.webhook_tolerance,
        ),
        purchases.clone(),
        provider,
    ));

    let _scheduler = reconcile::start_reconciliation(purchases.clone(), &reconcile_schedule).await?;

    info!("API service initialized successfully");

    let app_state = AppState {
        purchases,
        webhooks,
        jwt_service: Arc::new(jwt_service),
    };

    // Start the web server
    let app = routes::create_router(app_state);

    let server_config = ServerConfig::from_env();
    let listener = TcpListener::bind(&server_config.bind_addr).await?;
    info!("API service listening on {}", server_config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
