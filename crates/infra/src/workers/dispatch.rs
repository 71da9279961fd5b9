//! Dispatch pool: claims PENDING jobs and processes them.

use std::time::Duration;

use tracing::{debug, info, warn};

use reportflow_observability::Telemetry;

use super::{PollSchedule, PoolHandle, ShutdownSignal, spawn_pollers};
use crate::jobs::{JobProcessor, JobStoreError};

/// Dispatch pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Number of pollers; also the claim batch size.
    pub concurrency: usize,
    /// Sleep after an empty claim or a store error.
    pub idle_backoff: Duration,
    pub jitter: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            idle_backoff: Duration::from_millis(1000),
            jitter: 0.2,
        }
    }
}

impl DispatchConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DispatchPool {
    processor: JobProcessor,
    config: DispatchConfig,
    telemetry: Telemetry,
}

impl DispatchPool {
    pub fn new(processor: JobProcessor, config: DispatchConfig, telemetry: Telemetry) -> Self {
        Self {
            processor,
            config,
            telemetry,
        }
    }

    /// One claim + process pass. Returns how many jobs were claimed.
    pub async fn tick(&self) -> Result<usize, JobStoreError> {
        let jobs = self
            .processor
            .store()
            .claim_batch(self.config.concurrency.max(1))
            .await?;
        for job in &jobs {
            // Outcome failures are logged by the processor; the job stays
            // IN_PROGRESS for the stuck-job sweep.
            let _ = self.processor.process(job).await;
        }
        Ok(jobs.len())
    }

    pub fn spawn(self, shutdown: ShutdownSignal) -> PoolHandle {
        let telemetry = self.telemetry.clone();
        let concurrency = self.config.concurrency;
        spawn_pollers("dispatch", concurrency, &telemetry, |_| {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            pool.run(shutdown)
        })
    }

    async fn run(self, mut shutdown: ShutdownSignal) {
        let schedule = PollSchedule::new(self.config.idle_backoff, self.config.jitter);
        info!(concurrency = self.config.concurrency, "dispatch poller started");

        while !shutdown.is_triggered() {
            match self.tick().await {
                // Backlog: claim again right away.
                Ok(claimed) if claimed > 0 => {
                    debug!(claimed, "dispatched batch");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, transient = e.is_transient(), "claim failed; backing off");
                }
            }
            if shutdown.sleep(schedule.next_delay()).await {
                break;
            }
        }

        info!("dispatch poller stopped");
    }
}
