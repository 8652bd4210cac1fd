//! # Collator
//!
//! Consumer side of the sensor channels. Each cycle pulls whatever every
//! stream has pending and fuses it into one timestamped [`CompositeRecord`],
//! written as a JSON line through a [`DataHandler`]. A stream with nothing
//! pending is simply absent from that record.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tokio::time::Duration;
use tracing::{debug, info};

use crate::config::ChannelConfig;
use crate::error::Result;
use crate::ipc::{ChannelOptions, ChannelServer, DeliveryMode};
use crate::storage::{DataHandler, FlushPolicy};

/// Socket read size for the event camera, whose packets are much larger
pub const EVENT_CAMERA_BUFSIZE: usize = 32768;

/// Sensor streams known to the collator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStream {
    Gps,
    Imu,
    Telemetry,
    Atmos,
    EventCamera,
    PiCamera,
    IrCamera,
}

impl SensorStream {
    /// Delivery mode used when a channel does not set one
    ///
    /// Streams where only the newest message matters are FIFO; streams where
    /// every sample since the last cycle matters accumulate.
    pub fn default_mode(self) -> DeliveryMode {
        match self {
            SensorStream::Gps | SensorStream::PiCamera | SensorStream::IrCamera => DeliveryMode::Fifo,
            SensorStream::Imu
            | SensorStream::Telemetry
            | SensorStream::Atmos
            | SensorStream::EventCamera => DeliveryMode::Accumulate,
        }
    }

    /// Socket read size used when a channel does not set one
    pub fn default_bufsize(self) -> usize {
        match self {
            SensorStream::EventCamera => EVENT_CAMERA_BUFSIZE,
            _ => crate::ipc::server::DEFAULT_BUFSIZE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorStream::Gps => "gps",
            SensorStream::Imu => "imu",
            SensorStream::Telemetry => "telemetry",
            SensorStream::Atmos => "atmos",
            SensorStream::EventCamera => "event_camera",
            SensorStream::PiCamera => "pi_camera",
            SensorStream::IrCamera => "ir_camera",
        }
    }
}

/// Data pulled from one stream in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// One NMEA epoch
    Gps(String),
    Imu(Vec<String>),
    Telemetry(Vec<String>),
    Atmos(Vec<String>),
    /// Raw event-camera packets
    EventCamera(Vec<Bytes>),
    /// Latest still image
    PiCamera(Bytes),
    /// Latest still image
    IrCamera(Bytes),
}

impl Reading {
    /// Interpret the messages drained from `stream`
    ///
    /// Returns `None` when nothing arrived. Text streams are decoded lossily;
    /// image streams keep only the newest frame.
    pub fn from_messages(stream: SensorStream, messages: Vec<Bytes>) -> Option<Self> {
        if messages.is_empty() {
            return None;
        }

        let texts = |messages: Vec<Bytes>| -> Vec<String> {
            messages
                .iter()
                .map(|message| String::from_utf8_lossy(message).into_owned())
                .collect()
        };

        let reading = match stream {
            SensorStream::Gps => Reading::Gps(texts(messages).concat()),
            SensorStream::Imu => Reading::Imu(texts(messages)),
            SensorStream::Telemetry => Reading::Telemetry(texts(messages)),
            SensorStream::Atmos => Reading::Atmos(texts(messages)),
            SensorStream::EventCamera => Reading::EventCamera(messages),
            SensorStream::PiCamera => Reading::PiCamera(messages.into_iter().last()?),
            SensorStream::IrCamera => Reading::IrCamera(messages.into_iter().last()?),
        };
        Some(reading)
    }
}

fn base64_one<S: Serializer>(data: &Option<Bytes>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match data {
        Some(data) => serializer.serialize_some(&BASE64.encode(data)),
        None => serializer.serialize_none(),
    }
}

fn base64_all<S: Serializer>(data: &[Bytes], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(data.iter().map(|item| BASE64.encode(item)))
}

fn epoch_seconds<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(at.timestamp_millis() as f64 / 1000.0)
}

/// One fused record; binary payloads serialise as base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeRecord {
    #[serde(serialize_with = "epoch_seconds")]
    pub timestamp: DateTime<Utc>,
    pub gps: Option<String>,
    pub imu: Vec<String>,
    pub telemetry: Vec<String>,
    pub atmos: Vec<String>,
    #[serde(serialize_with = "base64_all")]
    pub event_frames: Vec<Bytes>,
    #[serde(serialize_with = "base64_one")]
    pub pi_image: Option<Bytes>,
    #[serde(serialize_with = "base64_one")]
    pub ir_image: Option<Bytes>,
}

impl CompositeRecord {
    /// Record at `timestamp` with no stream data
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            gps: None,
            imu: Vec::new(),
            telemetry: Vec::new(),
            atmos: Vec::new(),
            event_frames: Vec::new(),
            pi_image: None,
            ir_image: None,
        }
    }

    /// Fold readings into a record; later readings of a list stream append
    pub fn from_readings(timestamp: DateTime<Utc>, readings: impl IntoIterator<Item = Reading>) -> Self {
        let mut record = Self::empty(timestamp);
        for reading in readings {
            match reading {
                Reading::Gps(epoch) => record.gps = Some(epoch),
                Reading::Imu(samples) => record.imu.extend(samples),
                Reading::Telemetry(lines) => record.telemetry.extend(lines),
                Reading::Atmos(samples) => record.atmos.extend(samples),
                Reading::EventCamera(frames) => record.event_frames.extend(frames),
                Reading::PiCamera(image) => record.pi_image = Some(image),
                Reading::IrCamera(image) => record.ir_image = Some(image),
            }
        }
        record
    }

    /// Serialise as one newline-terminated JSON line
    pub fn to_json_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Channel servers for every configured stream
#[derive(Debug)]
pub struct Collator {
    channels: Vec<(SensorStream, ChannelServer)>,
    gps_wait: Duration,
}

impl Collator {
    pub fn new(gps_wait: Duration) -> Self {
        Self {
            channels: Vec::new(),
            gps_wait,
        }
    }

    pub fn add_channel(&mut self, stream: SensorStream, server: ChannelServer) {
        self.channels.push((stream, server));
    }

    /// Bind a server for each configured channel
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Channel` if any socket cannot be bound
    pub fn bind_all(configs: &[ChannelConfig], gps_wait: Duration) -> Result<Self> {
        let mut collator = Self::new(gps_wait);
        for config in configs {
            let options = ChannelOptions {
                bufsize: config.bufsize(),
                capacity: config.capacity,
            };
            let server = ChannelServer::bind(
                config.stream.name(),
                &config.socket_path,
                config.delivery_mode(),
                options,
            )?;
            collator.add_channel(config.stream, server);
        }
        info!("Collator listening on {} channels", collator.channels.len());
        Ok(collator)
    }

    pub fn streams(&self) -> impl Iterator<Item = SensorStream> + '_ {
        self.channels.iter().map(|(stream, _)| *stream)
    }

    fn take(stream: SensorStream, server: &ChannelServer) -> Vec<Bytes> {
        match (server.mode(), stream) {
            (DeliveryMode::Fifo, SensorStream::Gps) => server.try_recv().into_iter().collect(),
            _ => server.drain(),
        }
    }

    /// Readings from every stream without waiting
    pub fn poll(&self) -> Vec<Reading> {
        self.channels
            .iter()
            .filter_map(|(stream, server)| Reading::from_messages(*stream, Self::take(*stream, server)))
            .collect()
    }

    /// Build the next record
    ///
    /// A FIFO GPS channel is waited on for up to the configured GPS wait, so
    /// records follow the GPS epoch rate; every other stream is drained
    /// without waiting.
    pub async fn collect(&self) -> CompositeRecord {
        let mut readings = Vec::with_capacity(self.channels.len());

        for (stream, server) in &self.channels {
            let messages = match (server.mode(), stream) {
                (DeliveryMode::Fifo, SensorStream::Gps) => {
                    let epoch = server.recv_timeout(self.gps_wait).await;
                    if epoch.is_none() {
                        info!("No GPS packets available");
                    }
                    epoch.into_iter().collect()
                }
                _ => Self::take(*stream, server),
            };
            if let Some(reading) = Reading::from_messages(*stream, messages) {
                readings.push(reading);
            }
        }

        let record = CompositeRecord::from_readings(Utc::now(), readings);
        debug!(
            "Collated record: gps={} imu={} telemetry={} atmos={} events={} pi={} ir={}",
            record.gps.is_some(),
            record.imu.len(),
            record.telemetry.len(),
            record.atmos.len(),
            record.event_frames.len(),
            record.pi_image.is_some(),
            record.ir_image.is_some()
        );
        record
    }

    /// Collect one record and hand it to `handler`
    ///
    /// # Errors
    ///
    /// Propagates `DaqError::NoValidTarget` from the handler
    pub async fn run_once(&self, handler: &DataHandler) -> Result<CompositeRecord> {
        let record = self.collect().await;
        handler.write_data(record.to_json_line()?, FlushPolicy::Buffered).await?;
        Ok(record)
    }
}
