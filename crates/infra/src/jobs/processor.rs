//! The processing algorithm shared by the dispatch and retry pools.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use reportflow_core::{ArtifactUri, Job, StatusUpdate, UpdateOutcome};

use super::handler::{HandlerError, JobHandler};
use super::sink::{ArtifactSink, SinkError};
use super::store::{JobStore, JobStoreError};

/// Why an attempt failed. `Display` is what lands in the job's `error`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Runs one claimed job: handler, artifact upload, outcome write.
///
/// Failures are never retried here; they are written as FAILED and left to
/// the retry pool.
#[derive(Clone)]
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    artifacts: Arc<dyn ArtifactSink>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        artifacts: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            store,
            handler,
            artifacts,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Process a job the caller holds IN_PROGRESS and persist the outcome.
    ///
    /// The returned error is the outcome write failing; the job then stays
    /// IN_PROGRESS for the stuck-job sweep.
    pub async fn process(&self, job: &Job) -> Result<UpdateOutcome, JobStoreError> {
        let started = Instant::now();
        let attempt = job.attempt();

        let update = match self.run(job).await {
            Ok(uri) => StatusUpdate::completed(uri.to_string()),
            Err(e) => StatusUpdate::failed(e.to_string()),
        };
        let result = self.store.update_status(job.id, &update).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match (&result, &update) {
            (Ok(UpdateOutcome::Applied), StatusUpdate::Completed { result_path }) => {
                info!(
                    job_id = %job.id,
                    attempt,
                    duration_ms,
                    result_path = %result_path,
                    "job completed"
                );
            }
            (Ok(UpdateOutcome::Applied), StatusUpdate::Failed { error }) => {
                warn!(
                    job_id = %job.id,
                    attempt,
                    max_retries = self.store.retry_budget().max_retries,
                    duration_ms,
                    error = %error,
                    "job failed"
                );
            }
            (Ok(UpdateOutcome::Ignored), _) => {
                debug!(
                    job_id = %job.id,
                    attempt,
                    duration_ms,
                    status = %update.status(),
                    "job already terminal; outcome ignored"
                );
            }
            (Err(JobStoreError::NotFound(_)), _) => {
                warn!(job_id = %job.id, attempt, duration_ms, "job vanished; outcome dropped");
            }
            (Err(e), _) => {
                error!(
                    job_id = %job.id,
                    attempt,
                    duration_ms,
                    error = %e,
                    "failed to record job outcome"
                );
            }
        }

        result
    }

    async fn run(&self, job: &Job) -> Result<ArtifactUri, ProcessError> {
        let local = self.handler.handle(&job.job_type, &job.params).await?;
        let uri = self.artifacts.upload(&local).await?;
        Ok(uri)
    }
}

impl core::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobProcessor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use reportflow_core::{JobStatus, NewJob, RetryBudget, UserId};

    use crate::jobs::store::InMemoryJobStore;

    struct FixedHandler(Result<PathBuf, HandlerError>);

    #[async_trait]
    impl JobHandler for FixedHandler {
        async fn handle(&self, _: &str, _: &[u8]) -> Result<PathBuf, HandlerError> {
            self.0.clone()
        }
    }

    struct BucketSink {
        fail: bool,
    }

    #[async_trait]
    impl ArtifactSink for BucketSink {
        async fn upload(&self, local_path: &Path) -> Result<ArtifactUri, SinkError> {
            if self.fail {
                return Err(SinkError::Upload("bucket unavailable".into()));
            }
            let name = local_path.file_name().unwrap().to_string_lossy();
            Ok(ArtifactUri::new("s3", "reports-pdf", format!("reports/{name}")).unwrap())
        }
    }

    async fn claimed(store: &InMemoryJobStore) -> Job {
        store
            .insert(NewJob::new(UserId::new(1), "branch_performance_report", b"{}".to_vec()))
            .await
            .unwrap();
        store.claim_batch(1).await.unwrap().remove(0)
    }

    fn processor(
        store: &Arc<InMemoryJobStore>,
        handler: Result<PathBuf, HandlerError>,
        upload_fails: bool,
    ) -> JobProcessor {
        JobProcessor::new(
            store.clone(),
            Arc::new(FixedHandler(handler)),
            Arc::new(BucketSink { fail: upload_fails }),
        )
    }

    #[tokio::test]
    async fn success_writes_completed_with_uploaded_uri() {
        let store = InMemoryJobStore::arc(RetryBudget::default());
        let job = claimed(&store).await;
        let processor = processor(&store, Ok(PathBuf::from("/tmp/out/report.pdf")), false);

        let outcome = processor.process(&job).await.unwrap();

        assert_eq!(outcome, UpdateOutcome::Applied);
        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_path.as_deref(), Some("s3://reports-pdf/reports/report.pdf"));
        assert_eq!(job.error, None);
    }

    #[tokio::test]
    async fn handler_error_text_is_stored_verbatim() {
        let store = InMemoryJobStore::arc(RetryBudget::default());
        let job = claimed(&store).await;
        let processor = processor(
            &store,
            Err(HandlerError::ParamDecode("missing required parameter: month".into())),
            false,
        );

        processor.process(&job).await.unwrap();

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("missing required parameter: month"));
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.result_path, None);
    }

    #[tokio::test]
    async fn upload_failure_fails_the_job() {
        let store = InMemoryJobStore::arc(RetryBudget::default());
        let job = claimed(&store).await;
        let processor = processor(&store, Ok(PathBuf::from("/tmp/report.pdf")), true);

        processor.process(&job).await.unwrap();

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error.as_deref(),
            Some("artifact upload failed: bucket unavailable")
        );
    }

    #[tokio::test]
    async fn missing_job_is_reported_not_panicked() {
        let store = InMemoryJobStore::arc(RetryBudget::default());
        let job = NewJob::new(UserId::new(1), "t", vec![]).into_job(chrono::Utc::now());
        let processor = processor(&store, Ok(PathBuf::from("/tmp/r.pdf")), false);

        let err = processor.process(&job).await.unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }
}
