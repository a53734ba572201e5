use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{IngestionJobs, JobCrons, JobKind};

/// Cron-driven runner. Jobs share one gate, so at most one runs at a time.
pub struct HarvestScheduler {
    jobs: Arc<IngestionJobs>,
    crons: JobCrons,
    gate: Arc<Mutex<()>>,
}

impl HarvestScheduler {
    pub fn new(jobs: Arc<IngestionJobs>, crons: JobCrons) -> Self {
        Self {
            jobs,
            crons,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Wait for the gate, run the job, and log instead of propagating any failure.
    pub async fn run_guarded(jobs: &IngestionJobs, gate: &Mutex<()>, kind: JobKind) {
        let _turn = gate.lock().await;
        match jobs.run(kind).await {
            Ok(run) => info!(job = %kind, status = %run.status, "scheduled job finished"),
            Err(err) => error!(job = %kind, error = format!("{err:#}"), "scheduled job failed"),
        }
    }

    pub async fn build(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for kind in JobKind::ALL {
            let cron = self.crons.for_job(kind);
            let jobs = self.jobs.clone();
            let gate = self.gate.clone();
            let job = Job::new_async(cron, move |_uuid, _l| {
                let jobs = jobs.clone();
                let gate = gate.clone();
                Box::pin(async move {
                    Self::run_guarded(&jobs, &gate, kind).await;
                })
            })
            .with_context(|| format!("creating scheduler job {kind} for cron {cron}"))?;
            sched
                .add(job)
                .await
                .with_context(|| format!("adding scheduler job {kind}"))?;
            info!(job = %kind, cron, "job scheduled");
        }
        Ok(sched)
    }

    /// Run until ctrl-c, then stop triggering, let the current job finish and release browsers.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        let mut sched = self.build().await?;
        sched.start().await.context("starting scheduler")?;
        info!("scheduler running, press ctrl-c to stop");

        tokio::signal::ctrl_c()
            .await
            .context("listening for ctrl-c")?;
        info!("shutdown requested");

        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler did not shut down cleanly");
        }
        let _turn = self.gate.lock().await;
        self.jobs.release_browsers().await;
        info!("scheduler stopped");
        Ok(())
    }
}
