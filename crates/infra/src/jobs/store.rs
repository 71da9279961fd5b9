//! Job storage: the claim protocol and its implementations.
//!
//! Every mutating operation takes a skip-locked row lock first, so a row that
//! another transaction is holding is never blocked on and never handed out
//! twice. The in-memory store emulates the same discipline for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use reportflow_core::{
    DomainError, Job, JobId, JobStatus, NewJob, RetryBudget, StatusUpdate, UpdateOutcome,
};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Retry budget the reclaim predicate and terminal guard are evaluated with.
    fn retry_budget(&self) -> RetryBudget;

    /// Insert a new PENDING job (producer surface).
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError>;

    /// Read a job by id (status query).
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim up to `limit` PENDING jobs, oldest first, moving them to
    /// IN_PROGRESS. The claim is committed before the jobs are returned.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Write an outcome for a job. Writes against terminal rows are ignored.
    async fn update_status(
        &self,
        id: JobId,
        update: &StatusUpdate,
    ) -> Result<UpdateOutcome, JobStoreError>;

    /// Count one more attempt; returns the new counter value.
    async fn increment_retry_count(&self, id: JobId) -> Result<u32, JobStoreError>;

    /// Claim up to `limit` FAILED jobs with budget left, moving them to
    /// IN_PROGRESS.
    async fn reclaim_for_retry(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Lock up to `limit` jobs with an unreported outcome. The rows stay locked
    /// until the returned batch is committed or dropped.
    async fn reclaim_for_notification(
        &self,
        limit: usize,
    ) -> Result<Box<dyn NotificationBatch>, JobStoreError>;

    /// Counts per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// IN_PROGRESS jobs not touched for `older_than` (input for an external
    /// stuck-job sweep).
    async fn list_stuck(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;
}

/// An open notification transaction.
///
/// Dropping the batch without committing rolls it back: no job in it is
/// marked as notified and every row becomes claimable again.
#[async_trait]
pub trait NotificationBatch: Send {
    /// Locked jobs, oldest outcome first.
    fn jobs(&self) -> &[Job];

    /// Record a successful publish for `id` (applied on commit).
    async fn mark_sent(&mut self, id: JobId) -> Result<(), JobStoreError>;

    /// Commit the marks; returns how many rows were marked.
    async fn commit(self: Box<Self>) -> Result<usize, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job is locked by a concurrent transaction: {0}")]
    Locked(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id}: {source}")]
    InvalidTransition {
        id: JobId,
        #[source]
        source: DomainError,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

impl JobStoreError {
    /// Failures the poll loops should simply retry on their next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Locked(_) | JobStoreError::Storage(_))
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    /// FAILED jobs with no retry budget left.
    pub retry_exhausted: u64,
    /// COMPLETED/FAILED jobs whose notification has not been committed.
    pub awaiting_notification: u64,
}

#[derive(Debug)]
struct StoredJob {
    /// Insertion order, tie-breaker for equal timestamps.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
    /// Rows held by open notification batches.
    locked: HashSet<JobId>,
    #[cfg(test)]
    fail_commits: bool,
}

impl MemoryState {
    fn lockable(&self, id: JobId) -> Result<&StoredJob, JobStoreError> {
        if self.locked.contains(&id) {
            return Err(JobStoreError::Locked(id));
        }
        self.jobs.get(&id).ok_or(JobStoreError::NotFound(id))
    }

    /// Unlocked rows matching `filter`, ordered by `key` then insertion.
    fn select<K: Ord>(
        &self,
        filter: impl Fn(&Job) -> bool,
        key: impl Fn(&Job) -> K,
        limit: usize,
    ) -> Vec<JobId> {
        let mut candidates: Vec<_> = self
            .jobs
            .values()
            .filter(|s| !self.locked.contains(&s.job.id) && filter(&s.job))
            .collect();
        candidates.sort_by(|a, b| key(&a.job).cmp(&key(&b.job)).then(a.seq.cmp(&b.seq)));
        candidates.into_iter().take(limit).map(|s| s.job.id).collect()
    }

    fn move_to_in_progress(&mut self, ids: &[JobId]) -> Result<Vec<Job>, JobStoreError> {
        let now = Utc::now();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let stored = self.jobs.get_mut(id).ok_or(JobStoreError::NotFound(*id))?;
            stored
                .job
                .mark_in_progress(now)
                .map_err(|source| JobStoreError::InvalidTransition { id: *id, source })?;
            claimed.push(stored.job.clone());
        }
        Ok(claimed)
    }
}

/// In-memory job store for tests/dev.
///
/// Each operation runs under one mutex, which plays the role of a transaction;
/// rows held by open notification batches are skipped like skip-locked rows.
#[derive(Debug, Clone)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
    budget: RetryBudget,
}

impl InMemoryJobStore {
    pub fn new(budget: RetryBudget) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            budget,
        }
    }

    pub fn arc(budget: RetryBudget) -> Arc<Self> {
        Arc::new(Self::new(budget))
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Overwrite a stored row, bypassing the state machine (fixtures).
    #[cfg(test)]
    pub(crate) fn put(&self, job: Job) {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        let seq = state.jobs.get(&job.id).map_or(seq, |s| s.seq);
        state.jobs.insert(job.id, StoredJob { seq, job });
    }

    /// Make every subsequent notification commit fail.
    #[cfg(test)]
    pub(crate) fn fail_commits(&self, fail: bool) {
        self.state().fail_commits = fail;
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(RetryBudget::default())
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn retry_budget(&self) -> RetryBudget {
        self.budget
    }

    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut state = self.state();
        if state.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let job = job.into_job(Utc::now());
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(job.id, StoredJob { seq, job: job.clone() });
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.state().jobs.get(&id).map(|s| s.job.clone()))
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut state = self.state();
        let ids = state.select(|j| j.status == JobStatus::Pending, |j| j.created_at, limit);
        state.move_to_in_progress(&ids)
    }

    async fn update_status(
        &self,
        id: JobId,
        update: &StatusUpdate,
    ) -> Result<UpdateOutcome, JobStoreError> {
        let mut state = self.state();
        state.lockable(id)?;
        let budget = self.budget;
        let stored = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        stored
            .job
            .apply_update(update, &budget, Utc::now())
            .map_err(|source| JobStoreError::InvalidTransition { id, source })
    }

    async fn increment_retry_count(&self, id: JobId) -> Result<u32, JobStoreError> {
        let mut state = self.state();
        let next = self.budget.next_count(state.lockable(id)?.job.retry_count);
        let stored = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        stored.job.retry_count = next;
        stored.job.updated_at = Utc::now();
        Ok(next)
    }

    async fn reclaim_for_retry(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let budget = self.budget;
        let mut state = self.state();
        let ids = state.select(
            |j| j.status == JobStatus::Failed && budget.allows_retry(j.retry_count),
            |j| j.updated_at,
            limit,
        );
        state.move_to_in_progress(&ids)
    }

    async fn reclaim_for_notification(
        &self,
        limit: usize,
    ) -> Result<Box<dyn NotificationBatch>, JobStoreError> {
        let mut state = self.state();
        let ids = state.select(Job::awaiting_notification, |j| j.updated_at, limit);
        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            state.locked.insert(*id);
            if let Some(stored) = state.jobs.get(id) {
                jobs.push(stored.job.clone());
            }
        }
        Ok(Box::new(MemoryNotificationBatch {
            state: self.state.clone(),
            jobs,
            marked: Vec::new(),
            finished: false,
        }))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.state();
        let mut stats = JobStats::default();
        for stored in state.jobs.values() {
            let job = &stored.job;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::InProgress => stats.in_progress += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => {
                    stats.failed += 1;
                    if !self.budget.allows_retry(job.retry_count) {
                        stats.retry_exhausted += 1;
                    }
                }
            }
            if job.awaiting_notification() {
                stats.awaiting_notification += 1;
            }
        }
        Ok(stats)
    }

    async fn list_stuck(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let state = self.state();
        let mut stuck: Vec<_> = state
            .jobs
            .values()
            .filter(|s| s.job.status == JobStatus::InProgress && s.job.updated_at < cutoff)
            .collect();
        stuck.sort_by(|a, b| a.job.updated_at.cmp(&b.job.updated_at).then(a.seq.cmp(&b.seq)));
        Ok(stuck.into_iter().take(limit).map(|s| s.job.clone()).collect())
    }
}

struct MemoryNotificationBatch {
    state: Arc<Mutex<MemoryState>>,
    jobs: Vec<Job>,
    marked: Vec<JobId>,
    finished: bool,
}

impl MemoryNotificationBatch {
    fn release(&mut self, state: &mut MemoryState) {
        for job in &self.jobs {
            state.locked.remove(&job.id);
        }
        self.finished = true;
    }
}

#[async_trait]
impl NotificationBatch for MemoryNotificationBatch {
    fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    async fn mark_sent(&mut self, id: JobId) -> Result<(), JobStoreError> {
        if !self.jobs.iter().any(|j| j.id == id) {
            return Err(JobStoreError::NotFound(id));
        }
        if !self.marked.contains(&id) {
            self.marked.push(id);
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<usize, JobStoreError> {
        let state_handle = self.state.clone();
        let mut state = lock_state(&state_handle);

        #[cfg(test)]
        if state.fail_commits {
            self.release(&mut state);
            return Err(JobStoreError::Storage("commit failed".to_string()));
        }

        let mut count = 0;
        for id in &self.marked {
            if let Some(stored) = state.jobs.get_mut(id) {
                if !stored.job.notification_sent {
                    stored.job.notification_sent = true;
                    count += 1;
                }
            }
        }
        self.release(&mut state);
        Ok(count)
    }
}

impl Drop for MemoryNotificationBatch {
    fn drop(&mut self) {
        if !self.finished {
            let state_handle = self.state.clone();
            let mut state = lock_state(&state_handle);
            self.release(&mut state);
        }
    }
}
