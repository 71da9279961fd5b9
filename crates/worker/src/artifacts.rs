//! Filesystem artifact sink.
//!
//! Buckets are directories under a root. Objects are routed to a bucket by
//! file extension and keyed `reports/YYYY/MM/DD/<file name>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::{debug, info};

use reportflow_core::ArtifactUri;
use reportflow_infra::{ArtifactSink, SinkError};

use crate::config::ArtifactSettings;

#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    settings: ArtifactSettings,
}

impl FsArtifactSink {
    pub fn new(settings: ArtifactSettings) -> Self {
        Self { settings }
    }

    /// Bucket for a local file, by extension.
    pub fn bucket_for(&self, local_path: &Path) -> &str {
        let extension = local_path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            Some("pdf") => &self.settings.pdf_bucket,
            Some("docx") => &self.settings.docx_bucket,
            _ => &self.settings.default_bucket,
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.settings.root.join(bucket).join(key)
    }
}

/// `reports/YYYY/MM/DD/<file name>`
pub fn object_key(file_name: &str, date: NaiveDate) -> String {
    format!("reports/{}/{}", date.format("%Y/%m/%d"), file_name)
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn upload(&self, local_path: &Path) -> Result<ArtifactUri, SinkError> {
        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SinkError::Upload(format!("not a file path: {}", local_path.display()))
            })?;

        let bucket = self.bucket_for(local_path).to_string();
        let key = object_key(&file_name, Utc::now().date_naive());
        let uri = ArtifactUri::new(&self.settings.scheme, &bucket, &key)
            .map_err(|e| SinkError::Upload(e.to_string()))?;

        let dest = self.object_path(&bucket, &key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SinkError::Upload(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::copy(local_path, &dest)
            .await
            .map_err(|e| SinkError::Upload(format!("{}: {e}", local_path.display())))?;

        // The local copy is scratch output; losing the cleanup is harmless.
        if let Err(e) = tokio::fs::remove_file(local_path).await {
            debug!(path = %local_path.display(), error = %e, "failed to remove local artifact");
        }

        info!(uri = %uri, "artifact uploaded");
        Ok(uri)
    }
}
