//! Tracing/logging construction.
//!
//! JSON logs with timestamps by default, configurable via `RUST_LOG` or the
//! `[logging]` config section. The subscriber is wrapped in a
//! [`tracing::Dispatch`] so it can be passed to worker pools explicitly.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::Dispatch;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing_subscriber::EnvFilter;

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

/// An explicitly constructed logger.
///
/// Cheap to clone; every clone feeds the same subscriber.
#[derive(Clone)]
pub struct Telemetry {
    dispatch: Dispatch,
}

impl core::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

impl Telemetry {
    /// Build the subscriber described by `config`. `RUST_LOG` wins over
    /// `config.level` when set.
    pub fn from_config(config: &LogConfig) -> Self {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level));

        let dispatch = match config.format {
            LogFormat::Json => Dispatch::new(
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .json()
                    .with_timer(tracing_subscriber::fmt::time::SystemTime)
                    .with_target(false)
                    .finish(),
            ),
            LogFormat::Pretty => Dispatch::new(
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .finish(),
            ),
        };

        Self { dispatch }
    }

    /// A logger that drops everything (tests, embedding).
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    /// Wrap an existing dispatcher, e.g. a test capture subscriber.
    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Also make this the process default, for code outside the pools
    /// (startup, signal handling). Returns `false` if a default was already set.
    pub fn install_global(&self) -> bool {
        tracing::dispatcher::set_global_default(self.dispatch.clone()).is_ok()
    }

    /// Run `f` with this logger as the current dispatcher (span creation,
    /// one-off events).
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Bind a future to this logger for its whole lifetime.
    pub fn attach<F: Future>(&self, fut: F) -> WithDispatch<F> {
        fut.with_subscriber(self.dispatch.clone())
    }
}
