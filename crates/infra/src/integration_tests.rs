//! End-to-end tests for the job pipeline.
//!
//! Producer insert → dispatch → (retry) → notification, against the in-memory
//! store with stub renderer and sinks.

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use reportflow_core::{
        ArtifactUri, BranchPerformanceParams, Job, JobId, JobNotification, JobStatus, NewJob,
        RetryBudget, StatusUpdate, UpdateOutcome, UserId,
    };
    use reportflow_observability::Telemetry;

    use crate::jobs::{
        ArtifactSink, HandlerError, InMemoryJobStore, JobProcessor, JobStats, JobStore,
        JobStoreError, NotificationBatch, NotificationSink, ReportHandler, ReportRenderer,
        SinkError,
    };
    use crate::workers::{
        DispatchConfig, DispatchPool, NotificationConfig, NotificationPool, RetryConfig,
        RetryPool, Shutdown,
    };

    /// Renderer that fails its first `failures` calls.
    #[derive(Default)]
    struct FlakyRenderer {
        failures: AtomicUsize,
    }

    impl FlakyRenderer {
        fn failing(times: usize) -> Self {
            Self {
                failures: AtomicUsize::new(times),
            }
        }
    }

    #[async_trait]
    impl ReportRenderer for FlakyRenderer {
        async fn render_branch_performance(
            &self,
            params: &BranchPerformanceParams,
        ) -> Result<PathBuf, HandlerError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(HandlerError::generation("template engine unavailable"));
            }
            Ok(PathBuf::from(format!(
                "/tmp/reportflow/branch_report_{}_{}.{}",
                params.branch_id,
                params.month,
                params.format.extension()
            )))
        }
    }

    struct StubArtifacts;

    #[async_trait]
    impl ArtifactSink for StubArtifacts {
        async fn upload(&self, local_path: &Path) -> Result<ArtifactUri, SinkError> {
            let name = local_path
                .file_name()
                .ok_or_else(|| SinkError::Upload("no file name".into()))?
                .to_string_lossy()
                .into_owned();
            ArtifactUri::new("s3", "reports-pdf", format!("reports/{name}"))
                .map_err(|e| SinkError::Upload(e.to_string()))
        }
    }

    /// Records published events; rejects jobs listed in `reject` once each.
    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<JobNotification>>,
        reject: Mutex<Vec<JobId>>,
    }

    impl RecordingSink {
        fn published(&self) -> Vec<JobNotification> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn publish(&self, event: &JobNotification) -> Result<(), SinkError> {
            // Let concurrent ticks interleave.
            tokio::task::yield_now().await;
            {
                let mut reject = self.reject.lock().unwrap();
                if let Some(pos) = reject.iter().position(|id| *id == event.job_id) {
                    reject.remove(pos);
                    return Err(SinkError::Publish("broker unavailable".into()));
                }
            }
            self.published.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    /// Delegating store whose `increment_retry_count` fails `failures` times.
    struct FlakyIncrementStore {
        inner: Arc<InMemoryJobStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FlakyIncrementStore {
        fn retry_budget(&self) -> RetryBudget {
            self.inner.retry_budget()
        }

        async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(id).await
        }

        async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.claim_batch(limit).await
        }

        async fn update_status(
            &self,
            id: JobId,
            update: &StatusUpdate,
        ) -> Result<UpdateOutcome, JobStoreError> {
            self.inner.update_status(id, update).await
        }

        async fn increment_retry_count(&self, id: JobId) -> Result<u32, JobStoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.increment_retry_count(id).await
        }

        async fn reclaim_for_retry(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.reclaim_for_retry(limit).await
        }

        async fn reclaim_for_notification(
            &self,
            limit: usize,
        ) -> Result<Box<dyn NotificationBatch>, JobStoreError> {
            self.inner.reclaim_for_notification(limit).await
        }

        async fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats().await
        }

        async fn list_stuck(
            &self,
            older_than: Duration,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_stuck(older_than, limit).await
        }
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        dispatch: DispatchPool,
        retry: RetryPool,
        notify: NotificationPool,
        sink: Arc<RecordingSink>,
    }

    fn harness(max_retries: u32, renderer: FlakyRenderer) -> Harness {
        let store = InMemoryJobStore::arc(RetryBudget::new(max_retries));
        let sink = Arc::new(RecordingSink::default());
        let processor = JobProcessor::new(
            store.clone(),
            Arc::new(ReportHandler::new(renderer)),
            Arc::new(StubArtifacts),
        );
        let telemetry = Telemetry::disabled();

        Harness {
            dispatch: DispatchPool::new(
                processor.clone(),
                DispatchConfig::default()
                    .with_concurrency(2)
                    .with_idle_backoff(Duration::from_millis(5)),
                telemetry.clone(),
            ),
            retry: RetryPool::new(
                processor,
                RetryConfig::default()
                    .with_concurrency(1)
                    .with_poll_period(Duration::from_millis(5)),
                telemetry.clone(),
            ),
            notify: NotificationPool::new(
                store.clone(),
                sink.clone(),
                NotificationConfig::default()
                    .with_concurrency(2)
                    .with_poll_period(Duration::from_millis(5)),
                telemetry,
            ),
            store,
            sink,
        }
    }

    async fn insert(store: &InMemoryJobStore, params: serde_json::Value) -> Job {
        store
            .insert(NewJob::json(UserId::new(42), "branch_performance_report", &params))
            .await
            .unwrap()
    }

    async fn reload(store: &InMemoryJobStore, id: JobId) -> Job {
        store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn scenario_a_pending_job_completes_and_is_notified() {
        let h = harness(5, FlakyRenderer::default());
        let job = insert(
            &h.store,
            json!({"branch_id": 7, "month": "2024-05", "format": "pdf"}),
        )
        .await;
        assert_eq!(job.status, JobStatus::Pending);

        assert_eq!(h.dispatch.tick().await.unwrap(), 1);

        let done = reload(&h.store, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            done.result_path.as_deref(),
            Some("s3://reports-pdf/reports/branch_report_7_2024-05.pdf")
        );
        assert_eq!(done.error, None);
        assert!(!done.notification_sent);

        let tick = h.notify.tick().await.unwrap();
        assert_eq!((tick.locked, tick.published, tick.marked), (1, 1, 1));
        assert_eq!(
            h.sink.published(),
            vec![JobNotification {
                job_id: job.id,
                user_id: UserId::new(42),
                status: JobStatus::Completed,
                error: None,
            }]
        );
        assert!(reload(&h.store, job.id).await.notification_sent);

        // Nothing left to do.
        assert_eq!(h.dispatch.tick().await.unwrap(), 0);
        assert_eq!(h.notify.tick().await.unwrap().locked, 0);
    }

    #[tokio::test]
    async fn scenario_b_decode_failure_is_recorded_verbatim() {
        let h = harness(2, FlakyRenderer::default());
        let job = insert(&h.store, json!({"branch_id": 7, "format": "pdf"})).await;

        h.dispatch.tick().await.unwrap();

        let failed = reload(&h.store, job.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("missing required parameter: month"));
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.result_path, None);

        // Each retry tick counts one attempt until the budget is spent.
        assert_eq!(h.retry.tick().await.unwrap(), 1);
        assert_eq!(reload(&h.store, job.id).await.retry_count, 1);
        assert_eq!(h.retry.tick().await.unwrap(), 1);
        let exhausted = reload(&h.store, job.id).await;
        assert_eq!(exhausted.retry_count, 2);
        assert_eq!(exhausted.status, JobStatus::Failed);
        assert_eq!(exhausted.error.as_deref(), Some("missing required parameter: month"));

        assert_eq!(h.retry.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scenario_c_exhausted_job_is_never_retried() {
        let h = harness(5, FlakyRenderer::default());
        let mut job = insert(
            &h.store,
            json!({"branch_id": 7, "month": "2024-05", "format": "pdf"}),
        )
        .await;
        job.status = JobStatus::Failed;
        job.error = Some("template engine unavailable".into());
        job.retry_count = 5;
        h.store.put(job.clone());

        for _ in 0..5 {
            assert_eq!(h.retry.tick().await.unwrap(), 0);
        }
        assert_eq!(reload(&h.store, job.id).await, job);
    }

    #[tokio::test]
    async fn scenario_d_concurrent_notification_ticks_publish_once() {
        let h = harness(0, FlakyRenderer::failing(1));
        let job = insert(
            &h.store,
            json!({"branch_id": 7, "month": "2024-05", "format": "pdf"}),
        )
        .await;
        h.dispatch.tick().await.unwrap();
        assert_eq!(reload(&h.store, job.id).await.status, JobStatus::Failed);

        let other = h.notify.clone();
        let (first, second) = tokio::join!(h.notify.tick(), other.tick());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.published + second.published, 1);
        assert_eq!(first.locked + second.locked, 1);
        let published = h.sink.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].status, JobStatus::Failed);
        assert_eq!(published[0].error.as_deref(), Some("template engine unavailable"));
        assert!(reload(&h.store, job.id).await.notification_sent);
    }

    #[tokio::test]
    async fn transient_render_failure_recovers_on_retry() {
        let h = harness(5, FlakyRenderer::failing(1));
        let job = insert(
            &h.store,
            json!({"branch_id": 3, "month": "2024-01", "format": "docx"}),
        )
        .await;

        h.dispatch.tick().await.unwrap();
        let failed = reload(&h.store, job.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("template engine unavailable"));

        assert_eq!(h.retry.tick().await.unwrap(), 1);
        let done = reload(&h.store, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.error, None);
        assert!(done.result_path.is_some());
    }

    #[tokio::test]
    async fn failed_retry_increment_returns_job_to_failed() {
        let inner = InMemoryJobStore::arc(RetryBudget::new(5));
        let store = Arc::new(FlakyIncrementStore {
            inner: inner.clone(),
            failures: AtomicUsize::new(1),
        });
        let processor = JobProcessor::new(
            store,
            Arc::new(ReportHandler::new(FlakyRenderer::failing(1))),
            Arc::new(StubArtifacts),
        );
        let telemetry = Telemetry::disabled();
        let dispatch =
            DispatchPool::new(processor.clone(), DispatchConfig::default(), telemetry.clone());
        let retry = RetryPool::new(processor, RetryConfig::default(), telemetry);

        let job = insert(
            &inner,
            json!({"branch_id": 4, "month": "2024-03", "format": "pdf"}),
        )
        .await;
        dispatch.tick().await.unwrap();
        assert_eq!(reload(&inner, job.id).await.status, JobStatus::Failed);

        // The increment fails: the attempt is not run and the row goes back.
        assert_eq!(retry.tick().await.unwrap(), 1);
        let released = reload(&inner, job.id).await;
        assert_eq!(released.status, JobStatus::Failed);
        assert_eq!(released.retry_count, 0);
        assert_eq!(released.error.as_deref(), Some("template engine unavailable"));
        assert_eq!(inner.stats().await.unwrap().in_progress, 0);

        assert_eq!(retry.tick().await.unwrap(), 1);
        let done = reload(&inner, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.retry_count, 1);
    }

    #[tokio::test]
    async fn retryable_failure_is_notified_once_and_later_success_is_not() {
        let h = harness(5, FlakyRenderer::failing(1));
        let job = insert(
            &h.store,
            json!({"branch_id": 9, "month": "2024-06", "format": "pdf"}),
        )
        .await;

        h.dispatch.tick().await.unwrap();
        let tick = h.notify.tick().await.unwrap();
        assert_eq!((tick.locked, tick.published, tick.marked), (1, 1, 1));

        assert_eq!(h.retry.tick().await.unwrap(), 1);
        let done = reload(&h.store, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.notification_sent);

        assert_eq!(h.notify.tick().await.unwrap().locked, 0);
        let published = h.sink.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].status, JobStatus::Failed);
        assert_eq!(published[0].error.as_deref(), Some("template engine unavailable"));
    }

    #[tokio::test]
    async fn publish_failure_is_retried_next_tick() {
        let h = harness(5, FlakyRenderer::default());
        let a = insert(&h.store, json!({"branch_id": 1, "month": "2024-05", "format": "pdf"})).await;
        let b = insert(&h.store, json!({"branch_id": 2, "month": "2024-05", "format": "pdf"})).await;
        h.dispatch.tick().await.unwrap();
        h.sink.reject.lock().unwrap().push(a.id);

        let tick = h.notify.tick().await.unwrap();
        assert_eq!((tick.locked, tick.published, tick.marked), (2, 1, 1));
        assert!(!reload(&h.store, a.id).await.notification_sent);
        assert!(reload(&h.store, b.id).await.notification_sent);

        let tick = h.notify.tick().await.unwrap();
        assert_eq!((tick.locked, tick.published, tick.marked), (1, 1, 1));
        assert!(reload(&h.store, a.id).await.notification_sent);
        assert_eq!(h.sink.published().len(), 2);
    }

    #[tokio::test]
    async fn failed_commit_leaves_batch_for_republish() {
        let h = harness(5, FlakyRenderer::default());
        let job = insert(&h.store, json!({"branch_id": 1, "month": "2024-05", "format": "pdf"})).await;
        h.dispatch.tick().await.unwrap();

        h.store.fail_commits(true);
        assert!(h.notify.tick().await.is_err());
        assert!(!reload(&h.store, job.id).await.notification_sent);

        h.store.fail_commits(false);
        let tick = h.notify.tick().await.unwrap();
        assert_eq!(tick.marked, 1);
        // At-least-once: the event went out twice.
        assert_eq!(h.sink.published().len(), 2);
    }

    #[tokio::test]
    async fn running_pools_drain_backlog_and_shut_down() {
        let h = harness(5, FlakyRenderer::failing(3));
        let mut ids = Vec::new();
        for branch_id in 1..=20 {
            let job = insert(
                &h.store,
                json!({"branch_id": branch_id, "month": "2024-05", "format": "pdf"}),
            )
            .await;
            ids.push(job.id);
        }

        let shutdown = Shutdown::new();
        let handles = vec![
            h.dispatch.clone().spawn(shutdown.signal()),
            h.retry.clone().spawn(shutdown.signal()),
            h.notify.clone().spawn(shutdown.signal()),
        ];

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let stats = h.store.stats().await.unwrap();
                if stats.completed == 20 && stats.awaiting_notification == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        shutdown.trigger();
        for handle in handles {
            handle.join().await;
        }

        assert!(drained.is_ok(), "pools did not drain the backlog");
        for id in ids {
            let job = reload(&h.store, id).await;
            assert_eq!(job.status, JobStatus::Completed);
            assert!(job.notification_sent);
        }
        // At least one notification per job; duplicates are allowed.
        assert!(h.sink.published().len() >= 20);
    }
}
