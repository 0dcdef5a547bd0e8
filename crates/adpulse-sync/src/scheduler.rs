use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::orchestrator::Orchestrator;

/// Scheduler that runs a sync of every active company on `cron`.
pub async fn build_scheduler(cron: &str, orchestrator: Arc<Orchestrator>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            info!("scheduled sync triggered");
            match orchestrator.sync_all_active_companies().await {
                Ok(reports) => {
                    let failed = reports.iter().filter(|r| r.has_errors()).count();
                    info!(companies = reports.len(), failed, "scheduled sync finished");
                }
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// `None` unless `ADPULSE_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(&config.sync_cron, orchestrator).await.map(Some)
}
