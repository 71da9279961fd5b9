//! Outcome notification published for terminal jobs.

use serde::{Deserialize, Serialize};

use crate::id::{JobId, UserId};
use crate::job::{Job, JobStatus};

/// Event handed to the notification sink.
///
/// Delivery is at-least-once; consumers must tolerate duplicates keyed by
/// `job_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub user_id: UserId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for JobNotification {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id,
            status: job.status,
            error: job.error.clone(),
        }
    }
}
