//! strata: standalone broker process
//!
//! Loads configuration, opens the configured storages and metadata store,
//! and runs timeline retirement until interrupted.
//!
//! ## Configuration
//! - `strata.yaml` in the working directory, a path argument, or STRATA_CONFIG
//! - STRATA__<SECTION>__<KEY> environment overrides
//! - STRATA_LOG: tracing filter (default "info")

use tracing::{error, info};

use strata::config::Config;
use strata::facade::Broker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    strata::utils::bootstrap::init_tracing();

    let config_path = strata::utils::bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting strata");

    let broker = Broker::from_config(&config).await?;
    for record in broker.event_types().await? {
        info!(
            event_type = %record.name,
            partitions = record.partitions,
            "Event type loaded"
        );
    }

    let retirement = broker.spawn_retirement();
    info!(
        interval_ms = config.timelines.retirement_interval_ms,
        "Broker ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    retirement.stop();

    Ok(())
}
