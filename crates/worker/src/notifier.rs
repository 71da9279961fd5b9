//! Notification sink that emits events into the log stream.

use async_trait::async_trait;
use tracing::info;

use reportflow_core::JobNotification;
use reportflow_infra::{NotificationSink, SinkError};

/// Writes each event as a JSON payload on an `info` record.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn publish(&self, event: &JobNotification) -> Result<(), SinkError> {
        let payload =
            serde_json::to_string(event).map_err(|e| SinkError::Publish(e.to_string()))?;
        info!(
            job_id = %event.job_id,
            user_id = %event.user_id,
            status = %event.status,
            payload = %payload,
            "job notification"
        );
        Ok(())
    }
}
