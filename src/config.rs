//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::collator::SensorStream;
use crate::error::{DaqError, Result};
use crate::ipc::DeliveryMode;

/// Which role the binary runs
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Read NMEA sentences from a serial receiver and store them
    GpsLogger,
    /// Serve the sensor channels and write fused records
    Collator,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_mode")]
    pub mode: Mode,

    #[serde(default)]
    pub logging: LoggingConfig,

    pub storage: StorageConfig,

    #[serde(default)]
    pub gps: GpsConfig,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub collator: CollatorConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Daily-rolling log files are written here when set
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Storage handler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub sensor_name: String,

    #[serde(default = "default_extension")]
    pub extension: String,

    pub data_path: PathBuf,

    pub backup_path: PathBuf,

    #[serde(default = "default_recording_time_s")]
    pub recording_time_s: u64,

    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    #[serde(default = "default_buffer_interval_s")]
    pub buffer_interval_s: u64,

    #[serde(default = "default_socket_check_s")]
    pub socket_check_s: u64,

    #[serde(default)]
    pub record_mode: bool,

    #[serde(default = "default_removable_prefixes")]
    pub removable_prefixes: Vec<PathBuf>,
}

/// GPS receiver configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GpsConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_repair_limit")]
    pub repair_limit: usize,

    /// Sentence that closes an epoch and triggers a write
    #[serde(default = "default_flush_sentence")]
    pub flush_sentence: String,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

/// One collator input channel
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    pub stream: SensorStream,

    pub socket_path: PathBuf,

    /// Defaults to the stream's usual mode
    #[serde(default)]
    pub mode: Option<DeliveryMode>,

    /// Defaults to the stream's usual read size
    #[serde(default)]
    pub bufsize: Option<usize>,

    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

/// Collator timing
#[derive(Debug, Deserialize, Clone)]
pub struct CollatorConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_gps_wait_ms")]
    pub gps_wait_ms: u64,
}

// Default value functions
fn default_mode() -> Mode { Mode::GpsLogger }

fn default_log_level() -> String { "info".to_string() }

fn default_extension() -> String { ".txt".to_string() }
fn default_recording_time_s() -> u64 { 300 }
fn default_buffer_interval_s() -> u64 { 10 }
fn default_socket_check_s() -> u64 { 30 }
fn default_removable_prefixes() -> Vec<PathBuf> { vec![PathBuf::from("/mnt")] }

fn default_serial_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud_rate() -> u32 { 38400 }
fn default_repair_limit() -> usize { 1 }
fn default_flush_sentence() -> String { "$GNGLL".to_string() }
fn default_max_queue_size() -> usize { 1000 }

fn default_capacity() -> usize { crate::ipc::server::DEFAULT_FIFO_CAPACITY }

fn default_tick_ms() -> u64 { 1000 }
fn default_gps_wait_ms() -> u64 { 5000 }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            repair_limit: default_repair_limit(),
            flush_sentence: default_flush_sentence(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl Default for CollatorConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            gps_wait_ms: default_gps_wait_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.mode.unwrap_or_else(|| self.stream.default_mode())
    }

    pub fn bufsize(&self) -> usize {
        self.bufsize.unwrap_or_else(|| self.stream.default_bufsize())
    }
}

fn invalid(message: impl std::fmt::Display) -> DaqError {
    DaqError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use payload_daq::config::Config;
    ///
    /// let config = Config::load("config/gps.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        // Storage handler
        if self.storage.sensor_name.trim().is_empty() {
            return Err(invalid("storage sensor_name cannot be empty"));
        }

        if self.storage.data_path.as_os_str().is_empty() || self.storage.backup_path.as_os_str().is_empty() {
            return Err(invalid("storage data_path and backup_path cannot be empty"));
        }

        if self.storage.buffer_interval_s == 0 {
            return Err(invalid("buffer_interval_s must be greater than 0"));
        }

        if self.storage.socket_check_s == 0 {
            return Err(invalid("socket_check_s must be greater than 0"));
        }

        // GPS receiver
        if self.gps.port.is_empty() {
            return Err(invalid("gps port cannot be empty"));
        }

        if self.gps.baud_rate == 0 {
            return Err(invalid("gps baud_rate must be greater than 0"));
        }

        // 47^n candidates per sentence; beyond 3 the search stalls the reader
        if self.gps.repair_limit > 3 {
            return Err(invalid("repair_limit must be between 0 and 3"));
        }

        if self.gps.max_queue_size == 0 {
            return Err(invalid("max_queue_size must be greater than 0"));
        }

        if !self.gps.flush_sentence.starts_with('$') {
            return Err(invalid("flush_sentence must start with '$'"));
        }

        // Collator channels
        let mut socket_paths = HashSet::new();
        for channel in &self.channels {
            if channel.bufsize == Some(0) {
                return Err(invalid(format!("{} channel bufsize must be greater than 0", channel.stream.name())));
            }

            if channel.capacity == 0 {
                return Err(invalid(format!("{} channel capacity must be greater than 0", channel.stream.name())));
            }

            if !socket_paths.insert(&channel.socket_path) {
                return Err(invalid(format!(
                    "socket path {} used by more than one channel",
                    channel.socket_path.display()
                )));
            }
        }

        if self.mode == Mode::Collator && self.channels.is_empty() {
            return Err(invalid("collator mode requires at least one [[channels]] entry"));
        }

        if self.collator.tick_ms == 0 {
            return Err(invalid("collator tick_ms must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const GPS_CONFIG: &str = r#"
mode = "gps_logger"

[storage]
sensor_name = "gps"
data_path = "/home/pi/data/gps"
backup_path = "/mnt/usb/gps"
socket_path = "/tmp/gps.sock"
"#;

    const COLLATOR_CONFIG: &str = r#"
mode = "collator"

[logging]
level = "debug"
log_dir = "/var/log/payload"

[storage]
sensor_name = "event_synced"
extension = ".jsonl"
data_path = "/home/pi/data/collated"
backup_path = "/mnt/usb/collated"
recording_time_s = 600

[collator]
gps_wait_ms = 2000

[[channels]]
stream = "gps"
socket_path = "/tmp/gps.sock"

[[channels]]
stream = "event_camera"
socket_path = "/tmp/event.sock"

[[channels]]
stream = "imu"
socket_path = "/tmp/imu.sock"
mode = "fifo"
capacity = 64
bufsize = 1024
"#;

    #[test]
    fn test_gps_defaults() {
        let config = Config::from_toml(GPS_CONFIG).unwrap();
        assert_eq!(config.mode, Mode::GpsLogger);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.log_dir, None);
        assert_eq!(config.storage.extension, ".txt");
        assert_eq!(config.storage.recording_time_s, 300);
        assert_eq!(config.storage.buffer_interval_s, 10);
        assert_eq!(config.storage.socket_check_s, 30);
        assert!(!config.storage.record_mode);
        assert_eq!(config.storage.removable_prefixes, vec![PathBuf::from("/mnt")]);
        assert_eq!(config.storage.socket_path, Some(PathBuf::from("/tmp/gps.sock")));
        assert_eq!(config.gps.port, "/dev/ttyACM0");
        assert_eq!(config.gps.baud_rate, 38400);
        assert_eq!(config.gps.repair_limit, 1);
        assert_eq!(config.gps.flush_sentence, "$GNGLL");
        assert_eq!(config.gps.max_queue_size, 1000);
        assert!(config.channels.is_empty());
        assert_eq!(config.collator.tick_ms, 1000);
        assert_eq!(config.collator.gps_wait_ms, 5000);
    }

    #[test]
    fn test_collator_channels() {
        let config = Config::from_toml(COLLATOR_CONFIG).unwrap();
        assert_eq!(config.mode, Mode::Collator);
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("/var/log/payload")));
        assert_eq!(config.channels.len(), 3);

        let gps = &config.channels[0];
        assert_eq!(gps.stream, SensorStream::Gps);
        assert_eq!(gps.delivery_mode(), DeliveryMode::Fifo);
        assert_eq!(gps.bufsize(), 4096);
        assert_eq!(gps.capacity, 16);

        let events = &config.channels[1];
        assert_eq!(events.delivery_mode(), DeliveryMode::Accumulate);
        assert_eq!(events.bufsize(), 32768);

        let imu = &config.channels[2];
        assert_eq!(imu.delivery_mode(), DeliveryMode::Fifo);
        assert_eq!(imu.bufsize(), 1024);
        assert_eq!(imu.capacity, 64);
    }

    #[test]
    fn test_missing_storage_section() {
        let result = Config::from_toml("mode = \"gps_logger\"\n");
        assert!(matches!(result, Err(DaqError::Config(_))));
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let toml = format!("{}\n[[channels]]\nstream = \"lidar\"\nsocket_path = \"/tmp/l.sock\"\n", GPS_CONFIG);
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            GPS_CONFIG.replace("sensor_name = \"gps\"", "sensor_name = \" \""),
            format!("{}buffer_interval_s = 0\n", GPS_CONFIG),
            format!("{}socket_check_s = 0\n", GPS_CONFIG),
            format!("{}\n[gps]\nrepair_limit = 4\n", GPS_CONFIG),
            format!("{}\n[gps]\nbaud_rate = 0\n", GPS_CONFIG),
            format!("{}\n[gps]\nmax_queue_size = 0\n", GPS_CONFIG),
            format!("{}\n[gps]\nflush_sentence = \"GNGLL\"\n", GPS_CONFIG),
            GPS_CONFIG.replace("gps_logger", "collator"),
            COLLATOR_CONFIG.replace("capacity = 64", "capacity = 0"),
            COLLATOR_CONFIG.replace("bufsize = 1024", "bufsize = 0"),
            COLLATOR_CONFIG.replace("/tmp/event.sock", "/tmp/gps.sock"),
            COLLATOR_CONFIG.replace("gps_wait_ms = 2000", "tick_ms = 0"),
        ];

        for (index, case) in cases.iter().enumerate() {
            let result = Config::from_toml(case);
            assert!(
                matches!(result, Err(DaqError::Config(_))),
                "case {} should fail validation",
                index
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(GPS_CONFIG.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.storage.sensor_name, "gps");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/payload-daq.toml");
        assert!(matches!(result, Err(DaqError::Io(_))));
    }
}
