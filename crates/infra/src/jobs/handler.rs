//! Report handlers: turn a job's `type` + `params` into a local artifact.

use std::path::PathBuf;

use async_trait::async_trait;

use reportflow_core::{BranchPerformanceParams, ReportDecodeError, ReportRequest};

/// Handler failure. `Display` is the exact text stored in the job's `error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The parameter blob could not be decoded or failed validation.
    #[error("{0}")]
    ParamDecode(String),
    #[error("unsupported report type: {0}")]
    UnsupportedType(String),
    /// The generator itself failed.
    #[error("{0}")]
    Generation(String),
}

impl HandlerError {
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }
}

impl From<ReportDecodeError> for HandlerError {
    fn from(err: ReportDecodeError) -> Self {
        match err {
            ReportDecodeError::UnsupportedType(t) => HandlerError::UnsupportedType(t),
            ReportDecodeError::InvalidParams(msg) => HandlerError::ParamDecode(msg),
        }
    }
}

/// Produces an artifact for a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Returns the local path of the generated artifact.
    async fn handle(&self, job_type: &str, params: &[u8]) -> Result<PathBuf, HandlerError>;
}

/// Document generator, one method per report variant.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render_branch_performance(
        &self,
        params: &BranchPerformanceParams,
    ) -> Result<PathBuf, HandlerError>;
}

/// [`JobHandler`] that decodes the request and routes it to a renderer.
#[derive(Debug, Clone)]
pub struct ReportHandler<R> {
    renderer: R,
}

impl<R: ReportRenderer> ReportHandler<R> {
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl<R: ReportRenderer> JobHandler for ReportHandler<R> {
    async fn handle(&self, job_type: &str, params: &[u8]) -> Result<PathBuf, HandlerError> {
        match ReportRequest::decode(job_type, params)? {
            ReportRequest::BranchPerformance(p) => {
                self.renderer.render_branch_performance(&p).await
            }
        }
    }
}
