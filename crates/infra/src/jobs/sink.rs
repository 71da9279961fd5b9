//! Outbound collaborators: artifact storage and outcome notifications.

use std::path::Path;

use async_trait::async_trait;

use reportflow_core::{ArtifactUri, JobNotification};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("artifact upload failed: {0}")]
    Upload(String),
    #[error("notification publish failed: {0}")]
    Publish(String),
}

/// Uploads a generated artifact and returns where it now lives.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn upload(&self, local_path: &Path) -> Result<ArtifactUri, SinkError>;
}

/// Delivers outcome events. Delivery is at-least-once.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: &JobNotification) -> Result<(), SinkError>;
}
