//! Tracing/logging setup shared by every reportflow process.
//!
//! Nothing in here installs itself implicitly: callers build a [`Telemetry`]
//! from a [`LogConfig`] and hand it to the components that log.

/// Tracing configuration (filters, layers, injection helpers).
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat, Telemetry};
