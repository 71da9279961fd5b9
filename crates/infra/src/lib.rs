//! Infrastructure layer: job storage, processing and worker pools.

pub mod jobs;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use jobs::{
    ArtifactSink, HandlerError, InMemoryJobStore, JobHandler, JobProcessor, JobStats, JobStore,
    JobStoreError, NotificationBatch, NotificationSink, PostgresJobStore, ReportHandler,
    ReportRenderer, SinkError,
};
pub use workers::{
    DispatchConfig, DispatchPool, NotificationConfig, NotificationPool, PoolHandle,
    PollSchedule, RetryConfig, RetryPool, Shutdown, ShutdownSignal,
};
