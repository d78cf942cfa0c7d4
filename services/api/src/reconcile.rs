//! Periodic retry of PAID purchases whose fulfillment did not complete

use anyhow::Result;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::purchases::PurchaseService;

/// Schedule [`PurchaseService::reconcile_fulfillments`] on a cron expression.
///
/// The returned scheduler must be kept alive for the job to keep running.
pub async fn start_reconciliation(
    service: Arc<PurchaseService>,
    schedule: &str,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(schedule, move |_, _| {
        let service = service.clone();
        Box::pin(async move {
            debug!("Fulfillment reconciliation job executed");
            if let Err(e) = service.reconcile_fulfillments().await {
                error!("Fulfillment reconciliation failed: {}", e);
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    info!("Started fulfillment reconciliation with schedule: {}", schedule);
    Ok(scheduler)
}
