use anyhow::Context;

use reportflow_observability::Telemetry;
use reportflow_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::load().context("failed to load configuration")?;

    let telemetry = Telemetry::from_config(&config.logging);
    telemetry.install_global();

    reportflow_worker::app::run(config, telemetry).await
}
