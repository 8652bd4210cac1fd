//! # Payload DAQ
//!
//! Runs one role of the sensor payload data acquisition backbone, selected by
//! the `mode` key of the configuration file:
//!
//! - `gps_logger` reads NMEA sentences from the serial receiver and stores them
//! - `collator` serves the per-sensor sockets and writes one fused record per tick

use anyhow::{Context, Result};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use payload_daq::collator::Collator;
use payload_daq::config::{Config, Mode};
use payload_daq::gps::GpsLogger;
use payload_daq::logging::init_logging;
use payload_daq::serial::Transceiver;
use payload_daq::storage::{DataHandler, HandlerOptions};

/// Configuration used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/gps.toml";

/// Number of collated records between status log messages
const LOG_INTERVAL_RECORDS: u64 = 60;

/// Main entry point
///
/// # Usage
///
/// ```bash
/// payload-daq config/gps.toml
/// payload-daq config/collator.toml
/// ```
///
/// Ctrl+C stops the active role, writes out anything still buffered and exits.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;

    let _guard = init_logging(&config.logging);

    info!("Payload DAQ v{} starting ({:?})", env!("CARGO_PKG_VERSION"), config.mode);

    let handler = DataHandler::new(HandlerOptions::from(&config.storage))
        .await
        .context("starting storage handler")?;

    match config.mode {
        Mode::GpsLogger => run_gps_logger(&config, handler).await,
        Mode::Collator => run_collator(&config, handler).await,
    }
}

async fn run_gps_logger(config: &Config, handler: DataHandler) -> Result<()> {
    let link = Transceiver::open_with_paths(
        &[config.gps.port.as_str()],
        config.gps.baud_rate,
        config.gps.max_queue_size,
    )?;
    let mut logger = GpsLogger::new(link, handler, &config.gps);

    info!("Press Ctrl+C to exit");

    let outcome = tokio::select! {
        result = logger.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    };

    if let Err(e) = &outcome {
        error!("GPS logging stopped: {}", e);
    }
    logger.shutdown().await?;
    outcome.map_err(Into::into)
}

async fn run_collator(config: &Config, handler: DataHandler) -> Result<()> {
    let collator = Collator::bind_all(
        &config.channels,
        Duration::from_millis(config.collator.gps_wait_ms),
    )?;

    let mut tick = interval(Duration::from_millis(config.collator.tick_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Collating {} channels every {}ms",
        config.channels.len(),
        config.collator.tick_ms
    );
    info!("Press Ctrl+C to exit");

    let mut record_count: u64 = 0;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                match collator.run_once(&handler).await {
                    Ok(_) => {
                        record_count += 1;
                        if record_count % LOG_INTERVAL_RECORDS == 0 {
                            info!("Wrote {} records", record_count);
                        }
                    }
                    Err(e) => warn!("Failed to store record: {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                info!("Total records written: {}", record_count);
                break;
            }
        }
    }

    handler.flush().await?;
    Ok(())
}
