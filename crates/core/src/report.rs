//! Report requests: the typed view of a job's `type` + `params`.
//!
//! Jobs store their parameters as opaque bytes. Before anything is rendered the
//! pair is decoded into a [`ReportRequest`] variant, each carrying validated,
//! strongly-typed parameters. Decode failures are reported separately from
//! rendering failures so the processor can tell "bad request" from "broken
//! generator".

use core::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type tag of the branch performance report.
pub const BRANCH_PERFORMANCE_REPORT: &str = "branch_performance_report";

/// Why a job's `type` / `params` pair could not be turned into a request.
///
/// `Display` is the exact diagnostic that ends up in the job's `error` column.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReportDecodeError {
    #[error("unsupported report type: {0}")]
    UnsupportedType(String),

    #[error("{0}")]
    InvalidParams(String),
}

impl ReportDecodeError {
    fn missing(name: &str) -> Self {
        Self::InvalidParams(format!("missing required parameter: {name}"))
    }

    fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }
}

/// Output document format.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
        }
    }
}

impl core::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for DocumentFormat {
    type Err = ReportDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(DocumentFormat::Pdf),
            "docx" => Ok(DocumentFormat::Docx),
            other => Err(ReportDecodeError::invalid(format!(
                "unsupported format: {other}"
            ))),
        }
    }
}

/// Calendar month a report covers (`YYYY-MM`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportMonth(NaiveDate);

impl ReportMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    /// First day of the month.
    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }
}

impl core::fmt::Display for ReportMonth {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for ReportMonth {
    type Err = ReportDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReportDecodeError::invalid(format!("invalid month (expected YYYY-MM): {s}"));
        if s.len() != 7 {
            return Err(invalid());
        }
        NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d")
            .map(Self)
            .map_err(|_| invalid())
    }
}

/// Validated parameters of a branch performance report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPerformanceParams {
    pub branch_id: i64,
    pub month: ReportMonth,
    pub format: DocumentFormat,
}

/// Wire shape before validation: every field optional so a missing one can be
/// reported by name.
#[derive(Debug, Deserialize)]
struct RawBranchPerformanceParams {
    branch_id: Option<serde_json::Value>,
    month: Option<String>,
    format: Option<String>,
}

impl BranchPerformanceParams {
    fn decode(params: &[u8]) -> Result<Self, ReportDecodeError> {
        let raw: RawBranchPerformanceParams = serde_json::from_slice(params)
            .map_err(|e| ReportDecodeError::invalid(format!("invalid parameters: {e}")))?;

        let branch_id = raw.branch_id.ok_or_else(|| ReportDecodeError::missing("branch_id"))?;
        let month = raw.month.ok_or_else(|| ReportDecodeError::missing("month"))?;
        let format = raw.format.ok_or_else(|| ReportDecodeError::missing("format"))?;

        // Producers send JSON numbers; integral floats such as `7.0` are accepted.
        let branch_id = match branch_id.as_i64() {
            Some(id) => id,
            None => match branch_id.as_f64() {
                Some(f) if f.fract() == 0.0 && f.is_finite() => f as i64,
                _ => {
                    return Err(ReportDecodeError::invalid(format!(
                        "invalid branch_id: {branch_id}"
                    )));
                }
            },
        };
        if branch_id <= 0 {
            return Err(ReportDecodeError::invalid(format!(
                "invalid branch_id: {branch_id}"
            )));
        }

        Ok(Self {
            branch_id,
            month: month.parse()?,
            format: format.parse()?,
        })
    }
}

/// A report job after decode/validation, one variant per supported `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportRequest {
    BranchPerformance(BranchPerformanceParams),
}

impl ReportRequest {
    /// Decode a job's `type` tag and parameter blob.
    pub fn decode(job_type: &str, params: &[u8]) -> Result<Self, ReportDecodeError> {
        match job_type {
            BRANCH_PERFORMANCE_REPORT => {
                BranchPerformanceParams::decode(params).map(ReportRequest::BranchPerformance)
            }
            other => Err(ReportDecodeError::UnsupportedType(other.to_string())),
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            ReportRequest::BranchPerformance(_) => BRANCH_PERFORMANCE_REPORT,
        }
    }

    pub fn format(&self) -> DocumentFormat {
        match self {
            ReportRequest::BranchPerformance(p) => p.format,
        }
    }
}
