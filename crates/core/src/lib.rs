//! `reportflow-core`: report job domain.
//!
//! This crate contains **pure domain** types (no storage, no I/O): the job
//! record and its state machine, the retry budget, typed report requests and
//! the notification event.

pub mod artifact;
pub mod error;
pub mod id;
pub mod job;
pub mod notification;
pub mod report;

pub use artifact::ArtifactUri;
pub use error::{DomainError, DomainResult};
pub use id::{JobId, UserId};
pub use job::{
    DEFAULT_MAX_RETRIES, Job, JobStatus, NewJob, RetryBudget, StatusUpdate, UpdateOutcome,
};
pub use notification::JobNotification;
pub use report::{
    BRANCH_PERFORMANCE_REPORT, BranchPerformanceParams, DocumentFormat, ReportDecodeError,
    ReportMonth, ReportRequest,
};
