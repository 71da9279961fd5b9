//! Report job record and its lifecycle rules.
//!
//! ## State machine
//!
//! ```text
//! PENDING --claim--> IN_PROGRESS --success--> COMPLETED
//!                        |   ^
//!                failure |   | retry claim (retry_count < max)
//!                        v   |
//!                       FAILED
//! ```
//!
//! `COMPLETED` is terminal. `FAILED` is terminal once the retry budget is
//! spent. `notification_sent` is orthogonal: it flips to `true` once, from
//! either terminal status, and never resets.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, UserId};

/// Default number of retries a failed job is granted.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Persisted job status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Whether a job in this status has an outcome to report.
    pub fn has_outcome(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Edges of the state machine. The retry edge (`Failed -> InProgress`) is
    /// additionally gated by the retry budget, see [`RetryBudget::allows_retry`].
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Completed)
                | (JobStatus::InProgress, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::InProgress)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Retry budget shared by every component that reasons about retries.
///
/// A failed job is eligible while `retry_count < max_retries`. The retry pool
/// bumps the counter before each re-attempt, so a job gets one initial attempt
/// plus `max_retries` retries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_retries: u32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Counter value after one more attempt, capped at the maximum. Never
    /// lower than the current value, even if the maximum was reconfigured down.
    pub fn next_count(&self, retry_count: u32) -> u32 {
        retry_count
            .saturating_add(1)
            .min(self.max_retries)
            .max(retry_count)
    }

    /// Terminal means no further writes other than `notification_sent`.
    pub fn is_terminal(&self, status: JobStatus, retry_count: u32) -> bool {
        match status {
            JobStatus::Completed => true,
            JobStatus::Failed => !self.allows_retry(retry_count),
            JobStatus::Pending | JobStatus::InProgress => false,
        }
    }

    /// Guard applied by `UpdateStatus` before it writes an outcome.
    ///
    /// Writes against a terminal row are ignored rather than rejected: a late
    /// completion racing a retry claim must not fail the caller.
    pub fn check_update(
        &self,
        current: JobStatus,
        retry_count: u32,
        next: JobStatus,
    ) -> DomainResult<UpdateOutcome> {
        if self.is_terminal(current, retry_count) {
            return Ok(UpdateOutcome::Ignored);
        }
        if !current.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        Ok(UpdateOutcome::Applied)
    }
}

/// Result of an `UpdateStatus` call that did not fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The row was written.
    Applied,
    /// The row was already terminal; nothing changed.
    Ignored,
}

/// Outcome written by a processor for a job it holds IN_PROGRESS.
///
/// Carrying the error / result path inside the variant keeps the
/// `result_path` iff `COMPLETED` invariant out of callers' hands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Completed { result_path: String },
    Failed { error: String },
}

impl StatusUpdate {
    pub fn completed(result_path: impl Into<String>) -> Self {
        Self::Completed {
            result_path: result_path.into(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            StatusUpdate::Completed { .. } => JobStatus::Completed,
            StatusUpdate::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StatusUpdate::Failed { error } => Some(error),
            StatusUpdate::Completed { .. } => None,
        }
    }

    pub fn result_path(&self) -> Option<&str> {
        match self {
            StatusUpdate::Completed { result_path } => Some(result_path),
            StatusUpdate::Failed { .. } => None,
        }
    }
}

/// A job as submitted by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub user_id: UserId,
    pub job_type: String,
    pub params: Vec<u8>,
}

impl NewJob {
    pub fn new(user_id: UserId, job_type: impl Into<String>, params: Vec<u8>) -> Self {
        Self {
            id: JobId::new(),
            user_id,
            job_type: job_type.into(),
            params,
        }
    }

    /// Convenience for JSON payloads (what the producer API stores).
    pub fn json(
        user_id: UserId,
        job_type: impl Into<String>,
        params: &serde_json::Value,
    ) -> Self {
        Self::new(user_id, job_type, params.to_string().into_bytes())
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// The row as it looks right after insertion.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            user_id: self.user_id,
            job_type: self.job_type,
            params: self.params,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            error: None,
            retry_count: 0,
            result_path: None,
            notification_sent: false,
        }
    }
}

/// Persisted report job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    /// Tag selecting the report variant (`type` column).
    pub job_type: String,
    /// Opaque payload, only the handler interprets it.
    pub params: Vec<u8>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub result_path: Option<String>,
    pub notification_sent: bool,
}

impl Job {
    /// 1-based attempt number of the next (or current) processing run.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_terminal(&self, budget: &RetryBudget) -> bool {
        budget.is_terminal(self.status, self.retry_count)
    }

    /// Claim edge (`PENDING -> IN_PROGRESS` or the retry edge).
    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(JobStatus::InProgress) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: JobStatus::InProgress,
            });
        }
        self.status = JobStatus::InProgress;
        self.updated_at = now;
        Ok(())
    }

    /// Applies an outcome under the terminal-state guard.
    pub fn apply_update(
        &mut self,
        update: &StatusUpdate,
        budget: &RetryBudget,
        now: DateTime<Utc>,
    ) -> DomainResult<UpdateOutcome> {
        let outcome = budget.check_update(self.status, self.retry_count, update.status())?;
        if outcome == UpdateOutcome::Applied {
            self.status = update.status();
            self.error = update.error().map(str::to_owned);
            self.result_path = update.result_path().map(str::to_owned);
            self.updated_at = now;
        }
        Ok(outcome)
    }

    /// Whether the notification pool should pick this row up.
    pub fn awaiting_notification(&self) -> bool {
        self.status.has_outcome() && !self.notification_sent
    }
}
