//! Polling loop that runs pending jobs

use super::{Job, JobsContext};
use crate::error::BridgeResult;
use crate::metrics;

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

pub struct JobScheduler {
    ctx: Arc<JobsContext>,
    shutdown: Arc<RwLock<bool>>,
}

impl JobScheduler {
    pub fn new(ctx: Arc<JobsContext>, shutdown: Arc<RwLock<bool>>) -> Self {
        Self { ctx, shutdown }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let mut poll = interval(Duration::from_millis(self.ctx.config.poll_interval_ms));
        info!("Job scheduler started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            poll.tick().await;
            if let Err(e) = self.run_once().await {
                error!("Error running jobs: {}", e);
            }
        }

        info!("Job scheduler stopped");
        Ok(())
    }

    /// One pass over all pending jobs; returns how many were examined
    pub async fn run_once(&self) -> BridgeResult<usize> {
        let pending = self.ctx.state.jobs.pending_jobs()?;
        let count = pending.len();
        metrics::set_pending_jobs(count);

        let ctx = self.ctx.as_ref();
        stream::iter(pending)
            .for_each_concurrent(ctx.config.max_concurrent_jobs, |job| async move {
                run_job(ctx, job).await;
            })
            .await;

        Ok(count)
    }
}

async fn run_job(ctx: &JobsContext, mut job: Job) {
    if job.is_my_job_done(ctx) {
        job.do_finalize(ctx.config.max_retries);
    } else {
        job.do_my_job(ctx).await;
        if job.is_sufficient(ctx) {
            job.do_finalize(ctx.config.max_retries);
        }
    }

    match ctx.state.jobs.update_job(&job) {
        Ok(true) => {}
        Ok(false) => debug!("Job {} was removed while running", job.job_id),
        Err(e) => error!("Failed to persist job {}: {}", job.job_id, e),
    }
}
