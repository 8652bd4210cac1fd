//! # Serial Communication Module
//!
//! Duplexed, queue-based serial link used for the GPS receiver and the
//! telemetry radio.
//!
//! This module handles:
//! - Opening the serial port (8N1, no flow control, non-blocking reads)
//! - A writer loop draining an unbounded transmit queue
//! - A reader loop splitting the byte stream into `\r`/`\n` delimited messages
//! - A bounded receive queue that drops the oldest message on overflow

pub mod port_trait;

use bytes::{Buf, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::error::{DaqError, Result};
use crate::queue::DropOldestQueue;
use port_trait::{SerialPortIO, TokioSerialPort};

/// Maximum number of received messages held for the application
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Pause between polls of an idle serial device
const LOOP_IDLE: Duration = Duration::from_millis(1);

/// Longest pause between reads of a device that keeps failing
const READ_ERROR_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// While a device keeps failing, warn once per this many errors
const READ_ERROR_LOG_EVERY: u64 = 100;

/// Scratch buffer size for a single device read
const READ_CHUNK_SIZE: usize = 4096;

/// Serial handle shared by the reader and writer loops
type SharedPort = Arc<Mutex<Box<dyn SerialPortIO>>>;

/// Link counters, updated by the background loops
#[derive(Debug, Default)]
struct LinkCounters {
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    messages_dropped: AtomicU64,
    short_writes: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

/// Snapshot of the transceiver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Non-empty messages handed to the receive queue
    pub messages_received: u64,

    /// Raw bytes read from the device
    pub bytes_received: u64,

    /// Messages evicted from a full receive queue
    pub messages_dropped: u64,

    /// Writes where the device accepted fewer bytes than requested
    pub short_writes: u64,

    /// Failed device reads
    pub read_errors: u64,

    /// Failed device writes or flushes
    pub write_errors: u64,
}

/// Serial transceiver
///
/// Owns the serial device and the two background loops that service it.
/// Dropping the transceiver stops both loops.
pub struct Transceiver {
    device_path: String,
    transmit_tx: mpsc::UnboundedSender<Bytes>,
    receive_queue: Arc<DropOldestQueue<Bytes>>,
    counters: Arc<LinkCounters>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transceiver")
            .field("device_path", &self.device_path)
            .field("queued", &self.receive_queue.len())
            .finish_non_exhaustive()
    }
}

impl Transceiver {
    /// Open a serial device and start the reader and writer loops
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `path` - Device path (e.g., "/dev/ttyACM0")
    /// * `baud_rate` - Line speed (e.g., 38400 for the GPS receiver)
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Serial` if the device cannot be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use payload_daq::serial::Transceiver;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let gps = Transceiver::open("/dev/ttyACM0", 38400)?;
    ///     gps.transmit("$PUBX,00*33\r\n")?;
    ///     Ok(())
    /// }
    /// ```
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        Self::open_with_paths(&[path], baud_rate, MAX_QUEUE_SIZE)
    }

    /// Open the first device that succeeds from a list of candidates
    ///
    /// # Errors
    ///
    /// Returns `DaqError::SerialPortNotFound` listing every path tried
    pub fn open_with_paths(paths: &[&str], baud_rate: u32, max_queue_size: usize) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Opened serial device at {} ({} baud)", path, baud_rate);
                    return Ok(Self::with_port(
                        Box::new(TokioSerialPort::new(port)),
                        *path,
                        max_queue_size,
                    ));
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(DaqError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open a specific serial port with 8N1 and no flow control
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(Duration::ZERO)
            .open_native_async()
            .map_err(|e| DaqError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Start the transceiver loops over an already-open port
    pub fn with_port(
        port: Box<dyn SerialPortIO>,
        device_path: impl Into<String>,
        max_queue_size: usize,
    ) -> Self {
        let port: SharedPort = Arc::new(Mutex::new(port));
        let receive_queue = Arc::new(DropOldestQueue::new(max_queue_size));
        let counters = Arc::new(LinkCounters::default());
        let (transmit_tx, transmit_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(writer_loop(
            Arc::clone(&port),
            transmit_rx,
            Arc::clone(&counters),
        ));
        let reader = tokio::spawn(reader_loop(
            port,
            Arc::clone(&receive_queue),
            Arc::clone(&counters),
        ));

        Self {
            device_path: device_path.into(),
            transmit_tx,
            receive_queue,
            counters,
            tasks: vec![writer, reader],
        }
    }

    /// Queue bytes for transmission
    ///
    /// Strings are sent as their UTF-8 encoding.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Serial` if the writer loop has stopped
    pub fn transmit(&self, data: impl Into<Bytes>) -> Result<()> {
        self.transmit_tx
            .send(data.into())
            .map_err(|_| DaqError::Serial("Transmit loop has stopped".to_string()))
    }

    /// Take the oldest received message without waiting
    pub fn receive(&self) -> Option<Bytes> {
        self.receive_queue.try_pop()
    }

    /// Take the oldest received message, waiting up to `timeout`
    pub async fn wait_for_data(&self, timeout: Duration) -> Option<Bytes> {
        self.receive_queue.pop_timeout(timeout).await
    }

    /// Number of messages waiting in the receive queue
    pub fn receive_queue_len(&self) -> usize {
        self.receive_queue.len()
    }

    /// Discard every pending received message
    pub fn flush_receive_queue(&self) {
        self.receive_queue.clear();
    }

    /// Snapshot of the link counters
    pub fn stats(&self) -> LinkStats {
        let c = &self.counters;
        LinkStats {
            messages_received: c.messages_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            messages_dropped: c.messages_dropped.load(Ordering::Relaxed),
            short_writes: c.short_writes.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Get the device path of the opened serial port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Drain the transmit queue into the device
async fn writer_loop(
    port: SharedPort,
    mut transmit_rx: mpsc::UnboundedReceiver<Bytes>,
    counters: Arc<LinkCounters>,
) {
    while let Some(data) = transmit_rx.recv().await {
        let mut guard = port.lock().await;

        let written = match guard.write(&data).await {
            Ok(written) => written,
            Err(e) => {
                counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Serial error during transmission: {}", e);
                continue;
            }
        };

        if let Err(e) = guard.flush().await {
            counters.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Serial error flushing transmission: {}", e);
        }

        if written != data.len() {
            counters.short_writes.fetch_add(1, Ordering::Relaxed);
            warn!("Only {}/{} bytes written", written, data.len());
        }
    }

    debug!("Transmit queue closed, writer loop exiting");
}

/// Poll the device and split the byte stream into messages
async fn reader_loop(
    port: SharedPort,
    receive_queue: Arc<DropOldestQueue<Bytes>>,
    counters: Arc<LinkCounters>,
) {
    let mut buffer = BytesMut::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut failing: u64 = 0;

    loop {
        let read = {
            let mut guard = port.lock().await;
            guard.read_available(&mut chunk).await
        };

        if read.is_ok() && failing > 0 {
            info!("Serial reception recovered after {} errors", failing);
            failing = 0;
        }

        match read {
            Ok(0) => sleep(LOOP_IDLE).await,
            Ok(count) => {
                counters.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
                buffer.extend_from_slice(&chunk[..count]);

                for message in split_lines(&mut buffer) {
                    handle_received(&receive_queue, &counters, message);
                }
            }
            Err(e) => {
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                failing += 1;
                if failing == 1 {
                    warn!("Serial error during reception: {}", e);
                } else if failing % READ_ERROR_LOG_EVERY == 0 {
                    warn!("Serial reception still failing after {} errors: {}", failing, e);
                } else {
                    debug!("Serial error during reception: {}", e);
                }
                sleep(read_error_backoff(failing)).await;
            }
        }
    }
}

/// Pause after the `failing`-th consecutive read error: doubles from the idle
/// poll interval up to `READ_ERROR_BACKOFF_MAX`
fn read_error_backoff(failing: u64) -> Duration {
    let exponent = u32::try_from(failing.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
    LOOP_IDLE
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(READ_ERROR_BACKOFF_MAX)
}

fn handle_received(receive_queue: &DropOldestQueue<Bytes>, counters: &LinkCounters, message: Bytes) {
    counters.messages_received.fetch_add(1, Ordering::Relaxed);
    if receive_queue.push(message).is_some() {
        counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
        warn!("Receive queue full, dropping oldest message");
    }
}

/// Split complete messages off the front of `buffer`
///
/// A message ends at the first `\n` or `\r`; that delimiter and any directly
/// following `\r`/`\n` bytes are discarded. Empty messages are skipped and an
/// unterminated tail stays in `buffer`.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use payload_daq::serial::split_lines;
///
/// let mut buffer = BytesMut::from(&b"one\r\ntwo\rthree\nfou"[..]);
/// let lines = split_lines(&mut buffer);
/// assert_eq!(lines, vec!["one", "two", "three"]);
/// assert_eq!(&buffer[..], b"fou");
/// ```
pub fn split_lines(buffer: &mut BytesMut) -> Vec<Bytes> {
    let mut messages = Vec::new();

    while let Some(split_pos) = buffer.iter().position(|&b| b == b'\n' || b == b'\r') {
        let message = buffer.split_to(split_pos).freeze();
        buffer.advance(1);

        let extra = buffer
            .iter()
            .take_while(|&&b| b == b'\n' || b == b'\r')
            .count();
        buffer.advance(extra);

        if !message.is_empty() {
            messages.push(message);
        }
    }

    messages
}
