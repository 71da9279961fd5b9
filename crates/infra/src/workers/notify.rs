//! Notification pool: publishes outcomes of finished jobs.
//!
//! One transaction per tick. A job is marked only after its event was
//! published; a publish failure leaves that job for the next tick, a failed
//! commit leaves the whole batch unmarked. Delivery is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use reportflow_core::JobNotification;
use reportflow_observability::Telemetry;

use super::{PollSchedule, PoolHandle, ShutdownSignal, spawn_pollers};
use crate::jobs::{JobStore, JobStoreError, NotificationSink};

/// Notification pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub poll_period: Duration,
    pub jitter: f64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 10,
            poll_period: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl NotificationConfig {
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

/// Result of one notification tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyTick {
    /// Rows locked by this tick.
    pub locked: usize,
    /// Events the sink accepted.
    pub published: usize,
    /// Rows committed as notified.
    pub marked: usize,
}

#[derive(Clone)]
pub struct NotificationPool {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn NotificationSink>,
    config: NotificationConfig,
    telemetry: Telemetry,
}

impl core::fmt::Debug for NotificationPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotificationPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NotificationPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        sink: Arc<dyn NotificationSink>,
        config: NotificationConfig,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            sink,
            config,
            telemetry,
        }
    }

    pub async fn tick(&self) -> Result<NotifyTick, JobStoreError> {
        let mut batch = self
            .store
            .reclaim_for_notification(self.config.batch_size.max(1))
            .await?;
        let jobs = batch.jobs().to_vec();
        let mut published = 0;

        for job in &jobs {
            let event = JobNotification::from(job);
            match self.sink.publish(&event).await {
                Ok(()) => {
                    // A failed mark aborts the tick; dropping the batch rolls
                    // back and every job in it is republished later.
                    batch.mark_sent(job.id).await?;
                    published += 1;
                    debug!(job_id = %job.id, status = %job.status, "notification published");
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "notification publish failed");
                }
            }
        }

        let marked = batch.commit().await?;
        Ok(NotifyTick {
            locked: jobs.len(),
            published,
            marked,
        })
    }

    pub fn spawn(self, shutdown: ShutdownSignal) -> PoolHandle {
        let telemetry = self.telemetry.clone();
        let concurrency = self.config.concurrency;
        spawn_pollers("notification", concurrency, &telemetry, |_| {
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
            "notification poller started"
        );

        while !shutdown.is_triggered() {
            match self.tick().await {
                Ok(tick) if tick.locked > 0 => {
                    info!(
                        locked = tick.locked,
                        published = tick.published,
                        marked = tick.marked,
                        "notification batch committed"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, transient = e.is_transient(), "notification tick failed");
                }
            }
            if shutdown.sleep(schedule.next_delay()).await {
                break;
            }
        }

        info!("notification poller stopped");
    }
}
