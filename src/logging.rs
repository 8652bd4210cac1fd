//! # Logging
//!
//! `tracing` subscriber setup. Console output always; a daily-rolling file
//! is added when `logging.log_dir` is configured. `RUST_LOG` overrides the
//! configured level.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// File name prefix for rolling log files
pub const LOG_FILE_PREFIX: &str = "payload-daq.log";

/// Filter directive for the configured level
fn default_directive(level: &str) -> String {
    format!("payload_daq={}", level.trim().to_ascii_lowercase())
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(level)))
        .unwrap_or_else(|_| EnvFilter::new(default_directive("info")))
}

/// Initialize the logging system
///
/// Call once at startup. Keep the returned guard alive for the lifetime of
/// the process, dropping it flushes the file writer.
///
/// # Examples
///
/// ```no_run
/// use payload_daq::config::LoggingConfig;
/// use payload_daq::logging::init_logging;
///
/// let _guard = init_logging(&LoggingConfig::default());
/// ```
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(build_filter(&config.level))
        .with(fmt::layer().with_target(true))
        .with(file_layer);

    // Ignore the error if a subscriber is already installed
    let _ = subscriber.try_init();
    guard
}

/// Initialize logging for tests.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
