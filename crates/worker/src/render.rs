//! Stand-in renderer.
//!
//! Writes a JSON manifest of the requested report under the real artifact
//! name, so the whole pipeline (upload, URIs, notifications) runs without a
//! document engine.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use reportflow_core::{BranchPerformanceParams, DocumentFormat};
use reportflow_infra::{HandlerError, ReportRenderer};

#[derive(Debug, Clone)]
pub struct ManifestRenderer {
    output_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    report: &'a str,
    branch_id: i64,
    month: String,
    format: DocumentFormat,
    generated_at: DateTime<Utc>,
}

impl ManifestRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

/// `branch_report_<branch_id>_<YYYYMMDD_HHMMSS>.<ext>`
pub fn artifact_file_name(branch_id: i64, format: DocumentFormat, at: DateTime<Utc>) -> String {
    format!(
        "branch_report_{}_{}.{}",
        branch_id,
        at.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

#[async_trait]
impl ReportRenderer for ManifestRenderer {
    async fn render_branch_performance(
        &self,
        params: &BranchPerformanceParams,
    ) -> Result<PathBuf, HandlerError> {
        let now = Utc::now();
        let manifest = Manifest {
            report: "branch_performance_report",
            branch_id: params.branch_id,
            month: params.month.to_string(),
            format: params.format,
            generated_at: now,
        };
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| HandlerError::generation(format!("failed to encode report: {e}")))?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| HandlerError::generation(format!("failed to create output dir: {e}")))?;
        let path = self
            .output_dir
            .join(artifact_file_name(params.branch_id, params.format, now));
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| HandlerError::generation(format!("failed to write report: {e}")))?;

        Ok(path)
    }
}
