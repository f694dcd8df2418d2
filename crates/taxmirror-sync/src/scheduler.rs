//! Cron-triggered sync of every active session.

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::{sync_many, SessionSyncResult};
use crate::SyncServices;

#[derive(Clone)]
pub struct SyncScheduler {
    services: SyncServices,
    cancel: CancellationToken,
}

impl SyncScheduler {
    pub fn new(services: SyncServices, cancel: CancellationToken) -> Self {
        Self { services, cancel }
    }

    /// Sync all active sessions once and write a report per successful run.
    pub async fn run_once(&self) -> Result<Vec<SessionSyncResult>> {
        let sessions = self
            .services
            .credentials
            .list_active()
            .await
            .context("listing active sessions")?;
        info!(sessions = sessions.len(), "scheduled sync starting");

        let services = &self.services;
        let results = sync_many(
            &services.cache,
            |_| services.build_orchestrator(),
            &sessions,
            services.config.sync_months,
            &self.cancel,
        )
        .await;

        let reports = services.reports();
        for outcome in &results {
            match &outcome.result {
                Ok(report) => {
                    if let Err(err) = reports.write_sync_report(report).await {
                        warn!(session_id = %outcome.session_id, error = %err, "writing sync report failed");
                    }
                }
                Err(err) => warn!(session_id = %outcome.session_id, error = %err, "scheduled sync failed"),
            }
        }
        Ok(results)
    }

    /// `None` when scheduling is disabled in configuration.
    pub async fn build(&self) -> Result<Option<JobScheduler>> {
        if !self.services.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.services.config.sync_cron.clone();
        let runner = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                if runner.cancel.is_cancelled() {
                    return;
                }
                if let Err(err) = runner.run_once().await {
                    warn!(error = %err, "scheduled sync run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
