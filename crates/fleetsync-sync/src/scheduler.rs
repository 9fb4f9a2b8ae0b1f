//! Cron-driven runs. At most one run is in flight; a tick that fires while
//! the previous run is still going is skipped.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::run_with_config;

pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(Mutex::new(()));
    let job_config = config.clone();
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let in_flight = in_flight.clone();
        let config = job_config.clone();
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous sync run still in progress; skipping scheduled run");
                return;
            };
            match run_with_config(config).await {
                Ok(outcome) => info!(
                    run_id = %outcome.run_id,
                    succeeded = outcome.succeeded(),
                    passes = outcome.passes,
                    "scheduled sync run finished"
                ),
                Err(err) => error!(error = ?err, "scheduled sync run aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %cron, "sync scheduler configured");
    Ok(Some(sched))
}
