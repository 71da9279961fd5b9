//! Worker pools: dispatch, retry and notification.
//!
//! Each pool runs N independent pollers as tokio tasks. Pollers share nothing
//! but the store; all coordination goes through its row locks. Every poller
//! future runs under the pool's [`Telemetry`] inside a `poller` span.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info_span, warn};

use reportflow_observability::Telemetry;

pub mod dispatch;
pub mod notify;
pub mod retry;

pub use dispatch::{DispatchConfig, DispatchPool};
pub use notify::{NotificationConfig, NotificationPool};
pub use retry::{RetryConfig, RetryPool};

/// Owner side of the shutdown signal shared by every pool.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Ask every poller to stop after its current tick.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side; cheap to clone, one per poller.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested (or the owner is gone).
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `delay` unless shutdown comes first. Returns `true` when the
    /// poller should stop.
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.triggered() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Poll interval with multiplicative jitter, so pollers started together
/// drift apart instead of hitting the store in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSchedule {
    base: Duration,
    jitter: f64,
}

impl PollSchedule {
    /// `jitter` is the maximum relative deviation, clamped to `[0, 1]`.
    pub fn new(base: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { base, jitter }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// A delay in `[base * (1 - jitter), base * (1 + jitter)]`. Falls back to
    /// `base` when the jittered value does not fit in a `Duration`.
    pub fn next_delay(&self) -> Duration {
        if self.jitter == 0.0 || self.base.is_zero() {
            return self.base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(self.base.as_secs_f64() * factor).unwrap_or(self.base)
    }
}

/// Running pool; `join` waits for every poller to exit.
#[derive(Debug)]
pub struct PoolHandle {
    pool: &'static str,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn pool(&self) -> &'static str {
        self.pool
    }

    pub fn pollers(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for all pollers. Call after [`Shutdown::trigger`].
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(pool = self.pool, error = %err, "poller task ended abnormally");
            }
        }
    }
}

/// Spawn `concurrency` pollers built by `poller`.
pub(crate) fn spawn_pollers<F, Fut>(
    pool: &'static str,
    concurrency: usize,
    telemetry: &Telemetry,
    poller: F,
) -> PoolHandle
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let tasks = (0..concurrency.max(1))
        .map(|index| {
            let span = telemetry.in_scope(|| info_span!("poller", pool, poller = index));
            tokio::spawn(telemetry.attach(poller(index).instrument(span)))
        })
        .collect();

    PoolHandle { pool, tasks }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_jitter_is_exact() {
        let schedule = PollSchedule::new(Duration::from_millis(250), 0.0);
        for _ in 0..10 {
            assert_eq!(schedule.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn jittered_delay_stays_in_band() {
        let schedule = PollSchedule::new(Duration::from_secs(10), 0.2);
        for _ in 0..200 {
            let delay = schedule.next_delay();
            assert!(delay >= Duration::from_secs(8), "{delay:?}");
            assert!(delay <= Duration::from_secs(12), "{delay:?}");
        }
    }

    #[test]
    fn huge_base_does_not_overflow() {
        for base in [Duration::from_secs(u64::MAX), Duration::MAX] {
            let schedule = PollSchedule::new(base, 1.0);
            // Draws above `Duration::MAX` fall back to the base instead of panicking.
            let delays: Vec<_> = (0..100).map(|_| schedule.next_delay()).collect();
            assert!(delays.iter().all(|d| *d <= base));
        }
    }

    #[test]
    fn out_of_range_jitter_is_clamped() {
        assert_eq!(PollSchedule::new(Duration::from_secs(1), 7.0).jitter, 1.0);
        assert_eq!(PollSchedule::new(Duration::from_secs(1), -1.0).jitter, 0.0);
        assert_eq!(PollSchedule::new(Duration::from_secs(1), f64::NAN).jitter, 0.0);
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_shutdown() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_triggered());

        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(3600)).await });
        shutdown.trigger();

        assert!(sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn pool_handle_joins_all_pollers() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let handle = spawn_pollers("test", 3, &Telemetry::disabled(), |_| {
            let mut signal = signal.clone();
            async move { signal.triggered().await }
        });
        assert_eq!(handle.pollers(), 3);

        shutdown.trigger();
        handle.join().await;
    }
}
