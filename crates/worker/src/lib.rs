//! `reportflow-worker`: runs the dispatch, retry and notification pools
//! against Postgres.

pub mod app;
pub mod artifacts;
pub mod config;
pub mod notifier;
pub mod render;

pub use config::WorkerConfig;
