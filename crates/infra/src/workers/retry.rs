//! Retry pool: re-runs FAILED jobs that still have retry budget.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use reportflow_core::{Job, StatusUpdate};
use reportflow_observability::Telemetry;

use super::{PollSchedule, PoolHandle, ShutdownSignal, spawn_pollers};
use crate::jobs::{JobProcessor, JobStoreError};

/// Retry pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub poll_period: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 10,
            poll_period: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RetryPool {
    processor: JobProcessor,
    config: RetryConfig,
    telemetry: Telemetry,
}

impl RetryPool {
    pub fn new(processor: JobProcessor, config: RetryConfig, telemetry: Telemetry) -> Self {
        Self {
            processor,
            config,
            telemetry,
        }
    }

    /// One reclaim pass: each reclaimed job has its retry counter bumped and
    /// is then processed exactly like a fresh claim. Returns how many jobs
    /// were reclaimed.
    pub async fn tick(&self) -> Result<usize, JobStoreError> {
        let store = self.processor.store();
        let budget = store.retry_budget();
        let jobs = store.reclaim_for_retry(self.config.batch_size.max(1)).await?;

        for mut job in jobs.iter().cloned() {
            match store.increment_retry_count(job.id).await {
                Ok(retry_count) => job.retry_count = retry_count,
                Err(e) => {
                    // Unbumped attempts must not run. Put the row back as FAILED
                    // with its previous error so a later tick reclaims it.
                    warn!(job_id = %job.id, error = %e, "failed to increment retry count");
                    self.release(&job).await;
                    continue;
                }
            }
            debug!(
                job_id = %job.id,
                attempt = job.attempt(),
                max_retries = budget.max_retries,
                "retrying job"
            );
            let _ = self.processor.process(&job).await;
        }
        Ok(jobs.len())
    }

    async fn release(&self, job: &Job) {
        let error = job.error.as_deref().unwrap_or("retry attempt was not counted");
        match self
            .processor
            .store()
            .update_status(job.id, &StatusUpdate::failed(error))
            .await
        {
            Ok(_) => debug!(job_id = %job.id, "released job for a later retry"),
            Err(e) => error!(
                job_id = %job.id,
                error = %e,
                "failed to release job; left IN_PROGRESS for the stuck-job sweep"
            ),
        }
    }

    pub fn spawn(self, shutdown: ShutdownSignal) -> PoolHandle {
        let telemetry = self.telemetry.clone();
        let concurrency = self.config.concurrency;
        spawn_pollers("retry", concurrency, &telemetry, |_| {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            pool.run(shutdown)
        })
    }

    async fn run(self, mut shutdown: ShutdownSignal) {
        let schedule = PollSchedule::new(self.config.poll_period, self.config.jitter);
        info!(
            batch_size = self.config.batch_size,
            poll_period_ms = schedule.base().as_millis() as u64,
            "retry poller started"
        );

        while !shutdown.is_triggered() {
            match self.tick().await {
                Ok(0) => {}
                Ok(reclaimed) => debug!(reclaimed, "retried batch"),
                Err(e) => {
                    warn!(error = %e, transient = e.is_transient(), "retry reclaim failed");
                }
            }
            if shutdown.sleep(schedule.next_delay()).await {
                break;
            }
        }

        info!("retry poller stopped");
    }
}
