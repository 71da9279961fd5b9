//! Worker configuration.
//!
//! Layered with figment: built-in defaults, then the TOML file named by
//! `REPORTFLOW_CONFIG` (default `reportflow.toml`, optional), then
//! `REPORTFLOW_*` environment variables with `__` between nested keys, e.g.
//! `REPORTFLOW_DATABASE__URL` or `REPORTFLOW_RETRY__POLL_PERIOD_SECS`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use reportflow_core::{DEFAULT_MAX_RETRIES, RetryBudget};
use reportflow_infra::{DispatchConfig, NotificationConfig, RetryConfig};
use reportflow_observability::LogConfig;

pub const CONFIG_PATH_ENV: &str = "REPORTFLOW_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "reportflow.toml";
const ENV_PREFIX: &str = "REPORTFLOW_";

/// Top-level config (reportflow.toml + REPORTFLOW_* env overrides).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub database: DatabaseSettings,
    pub store: StoreSettings,
    pub dispatch: DispatchSettings,
    pub retry: RetrySettings,
    pub notification: NotificationSettings,
    pub artifacts: ArtifactSettings,
    pub render: RenderSettings,
    pub logging: LogConfig,
}

impl WorkerConfig {
    /// Load from the file named by `REPORTFLOW_CONFIG` plus the environment.
    pub fn load() -> Result<Self, figment::Error> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self, figment::Error> {
        Self::figment(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"))
            .extract()
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(WorkerConfig::default())).merge(file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Run the idempotent DDL at startup.
    pub ensure_schema: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/reportflow".to_string(),
            max_connections: 20,
            acquire_timeout_secs: 5,
            ensure_schema: true,
        }
    }
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub max_retries: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl StoreSettings {
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.max_retries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub enabled: bool,
    pub concurrency: usize,
    pub idle_backoff_ms: u64,
    pub jitter: f64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let defaults = DispatchConfig::default();
        Self {
            enabled: true,
            concurrency: defaults.concurrency,
            idle_backoff_ms: defaults.idle_backoff.as_millis() as u64,
            jitter: defaults.jitter,
        }
    }
}

impl DispatchSettings {
    pub fn pool_config(&self) -> DispatchConfig {
        DispatchConfig::default()
            .with_concurrency(self.concurrency)
            .with_idle_backoff(Duration::from_millis(self.idle_backoff_ms))
            .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub concurrency: usize,
    pub batch_size: usize,
    pub poll_period_secs: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            enabled: true,
            concurrency: defaults.concurrency,
            batch_size: defaults.batch_size,
            poll_period_secs: defaults.poll_period.as_secs(),
            jitter: defaults.jitter,
        }
    }
}

impl RetrySettings {
    pub fn pool_config(&self) -> RetryConfig {
        RetryConfig::default()
            .with_concurrency(self.concurrency)
            .with_batch_size(self.batch_size)
            .with_poll_period(Duration::from_secs(self.poll_period_secs))
            .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub concurrency: usize,
    pub batch_size: usize,
    pub poll_period_secs: u64,
    pub jitter: f64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        let defaults = NotificationConfig::default();
        Self {
            enabled: true,
            concurrency: defaults.concurrency,
            batch_size: defaults.batch_size,
            poll_period_secs: defaults.poll_period.as_secs(),
            jitter: defaults.jitter,
        }
    }
}

impl NotificationSettings {
    pub fn pool_config(&self) -> NotificationConfig {
        NotificationConfig::default()
            .with_concurrency(self.concurrency)
            .with_batch_size(self.batch_size)
            .with_poll_period(Duration::from_secs(self.poll_period_secs))
            .with_jitter(self.jitter)
    }
}

/// Where uploaded artifacts go and how their URIs look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    /// Directory standing in for the object store; one subdirectory per bucket.
    pub root: PathBuf,
    pub scheme: String,
    pub pdf_bucket: String,
    pub docx_bucket: String,
    pub default_bucket: String,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
            scheme: "file".to_string(),
            pdf_bucket: "reports-pdf".to_string(),
            docx_bucket: "reports-docx".to_string(),
            default_bucket: "reports".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Scratch directory for generated documents before upload.
    pub output_dir: PathBuf,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir().join("reportflow"),
        }
    }
}
