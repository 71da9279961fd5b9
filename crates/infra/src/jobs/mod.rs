//! Report job system: storage, handlers, sinks and the processing step.
//!
//! ## Components
//!
//! - `JobStore`: the claim protocol (in-memory or Postgres)
//! - `JobHandler` / `ReportRenderer`: decode a job and produce an artifact
//! - `ArtifactSink` / `NotificationSink`: outbound collaborators
//! - `JobProcessor`: handler + upload + outcome write, shared by the
//!   dispatch and retry pools

pub mod handler;
pub mod postgres;
pub mod processor;
pub mod sink;
pub mod store;

pub use handler::{HandlerError, JobHandler, ReportHandler, ReportRenderer};
pub use postgres::PostgresJobStore;
pub use processor::{JobProcessor, ProcessError};
pub use sink::{ArtifactSink, NotificationSink, SinkError};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, NotificationBatch};
