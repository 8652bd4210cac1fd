//! # Storage Module
//!
//! Resilient storage for one sensor's output stream.
//!
//! A [`DataHandler`] buffers sensor output and appends it to a primary and a
//! backup directory, or forwards it to a local channel while a consumer is
//! listening there. Targets are revalidated whenever a write fails, on every
//! file rotation and periodically for the channel, so a sensor loop keeps
//! running when removable media disappears and switches back when it returns.
//!
//! Background work per handler:
//! - one writer task per directory target
//! - a one-second housekeeping tick (file rotation, overdue buffer flush)
//! - a channel liveness check
//! - an outbound task feeding the channel (only with a socket path)

pub mod mount;
pub mod target;
pub mod writer;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{DaqError, Result};
use crate::ipc::ChannelClient;
use mount::{MountProbe, SystemMountProbe};
use target::{is_removable, validate_directory, validate_socket, StorageTarget, TargetKind};
use writer::{TargetWriter, WriteCompletion};

/// Default seconds between buffer flushes
pub const DEFAULT_BUFFER_INTERVAL: Duration = Duration::from_secs(10);

/// Default seconds between channel liveness probes
pub const DEFAULT_SOCKET_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Housekeeping tick for rotation and overdue flushes
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(1);

/// Delay between outbound reconnect attempts
const OUTBOUND_RETRY: Duration = Duration::from_secs(1);

/// Construction parameters for a [`DataHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    pub sensor_name: String,
    /// Appended verbatim to file names (include the dot)
    pub extension: String,
    pub data_path: PathBuf,
    pub backup_path: PathBuf,
    /// Time per output file; zero keeps a single growing file
    pub recording_time: Duration,
    pub socket_path: Option<PathBuf>,
    pub buffer_interval: Duration,
    pub socket_check_interval: Duration,
    /// Frame each buffered write as a length-prefixed record
    pub record_mode: bool,
    /// Paths under these prefixes are checked against attached USB drives
    pub removable_prefixes: Vec<PathBuf>,
}

impl HandlerOptions {
    pub fn new(
        sensor_name: impl Into<String>,
        extension: impl Into<String>,
        data_path: impl Into<PathBuf>,
        backup_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sensor_name: sensor_name.into(),
            extension: extension.into(),
            data_path: data_path.into(),
            backup_path: backup_path.into(),
            recording_time: Duration::ZERO,
            socket_path: None,
            buffer_interval: DEFAULT_BUFFER_INTERVAL,
            socket_check_interval: DEFAULT_SOCKET_CHECK_INTERVAL,
            record_mode: false,
            removable_prefixes: vec![PathBuf::from("/mnt")],
        }
    }
}

impl From<&StorageConfig> for HandlerOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            sensor_name: config.sensor_name.clone(),
            extension: config.extension.clone(),
            data_path: config.data_path.clone(),
            backup_path: config.backup_path.clone(),
            recording_time: Duration::from_secs(config.recording_time_s),
            socket_path: config.socket_path.clone(),
            buffer_interval: Duration::from_secs(config.buffer_interval_s),
            socket_check_interval: Duration::from_secs(config.socket_check_s),
            record_mode: config.record_mode,
            removable_prefixes: config.removable_prefixes.clone(),
        }
    }
}

/// Sensor output normalised to bytes
///
/// Sequences of chunks are concatenated and strings are UTF-8 encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn concat<I, T>(chunks: I) -> Bytes
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut joined = BytesMut::new();
    for chunk in chunks {
        joined.extend_from_slice(chunk.as_ref());
    }
    joined.freeze()
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload(Bytes::from(data))
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Payload(Bytes::copy_from_slice(data))
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(data: &[u8; N]) -> Self {
        Payload(Bytes::copy_from_slice(data))
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Payload(Bytes::from(data))
    }
}

impl From<&str> for Payload {
    fn from(data: &str) -> Self {
        Payload(Bytes::copy_from_slice(data.as_bytes()))
    }
}

impl From<Vec<Bytes>> for Payload {
    fn from(chunks: Vec<Bytes>) -> Self {
        Payload(concat(chunks))
    }
}

impl From<Vec<Vec<u8>>> for Payload {
    fn from(chunks: Vec<Vec<u8>>) -> Self {
        Payload(concat(chunks))
    }
}

impl From<Vec<String>> for Payload {
    fn from(chunks: Vec<String>) -> Self {
        Payload(concat(chunks))
    }
}

impl From<&[&str]> for Payload {
    fn from(chunks: &[&str]) -> Self {
        Payload(concat(chunks))
    }
}

/// When a buffered write reaches disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Flush once the buffer interval has elapsed
    #[default]
    Buffered,
    /// Flush now into the current file
    Immediate,
    /// Start a new file, then flush into it
    NewFile,
}

/// Validation state of every target of a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoints {
    pub data: StorageTarget,
    pub backup: StorageTarget,
    pub socket: Option<StorageTarget>,
}

impl Savepoints {
    fn unvalidated(options: &HandlerOptions) -> Self {
        Self {
            data: StorageTarget::unvalidated(TargetKind::Data, &options.data_path),
            backup: StorageTarget::unvalidated(TargetKind::Backup, &options.backup_path),
            socket: options
                .socket_path
                .as_ref()
                .map(|path| StorageTarget::unvalidated(TargetKind::Socket, path)),
        }
    }

    /// `true` while a consumer is listening on the channel
    pub fn channel_active(&self) -> bool {
        self.socket.as_ref().is_some_and(StorageTarget::is_writable)
    }

    /// `true` if at least one directory target accepts writes
    pub fn any_directory_writable(&self) -> bool {
        self.data.is_writable() || self.backup.is_writable()
    }
}

#[derive(Debug)]
struct FileState {
    index: u64,
    file_name: String,
    buffer: Vec<Bytes>,
    last_buffer_save: Instant,
    last_rotation: Instant,
}

/// Output file name for one recording
///
/// # Examples
///
/// ```
/// use chrono::{Local, TimeZone};
/// use payload_daq::storage::file_name;
///
/// let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
/// assert_eq!(file_name("gps", ".txt", 3, at), "gps_data_20240309_140507_3.txt");
/// ```
pub fn file_name(sensor_name: &str, extension: &str, index: u64, at: DateTime<Local>) -> String {
    format!(
        "{}_data_{}_{}{}",
        sensor_name,
        at.format("%Y%m%d_%H%M%S"),
        index,
        extension
    )
}

/// Serialise buffered writes for one flush
fn serialize_buffer(buffer: &[Bytes], record_mode: bool) -> Bytes {
    if !record_mode {
        return concat(buffer);
    }

    let mut framed = BytesMut::with_capacity(buffer.iter().map(|item| item.len() + 4).sum());
    for item in buffer {
        match u32::try_from(item.len()) {
            Ok(len) => {
                framed.put_u32_le(len);
                framed.put_slice(item);
            }
            Err(_) => warn!("Skipping record of {} bytes, too large to frame", item.len()),
        }
    }
    framed.freeze()
}

struct Inner {
    options: HandlerOptions,
    probe: Arc<dyn MountProbe>,
    savepoints: Mutex<Savepoints>,
    state: Mutex<FileState>,
    data_writer: TargetWriter,
    backup_writer: TargetWriter,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    socket_ready: Arc<Notify>,
    last_announcement: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resilient writer for one sensor's output
///
/// Cloning yields another handle to the same handler. Background tasks stop
/// when the last handle is dropped; call [`DataHandler::flush`] first to
/// persist anything still buffered.
#[derive(Clone)]
pub struct DataHandler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandler")
            .field("sensor_name", &self.inner.options.sensor_name)
            .field("savepoints", &*lock(&self.inner.savepoints))
            .finish_non_exhaustive()
    }
}

impl DataHandler {
    /// Create a handler that checks removable media against the live system
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for construction checks
    /// without breaking callers.
    pub async fn new(options: HandlerOptions) -> Result<Self> {
        Self::with_probe(options, Arc::new(SystemMountProbe::new())).await
    }

    /// Create a handler with a custom mount probe
    ///
    /// Validates and creates the target directories, picks the first file
    /// name and starts the background tasks.
    pub async fn with_probe(options: HandlerOptions, probe: Arc<dyn MountProbe>) -> Result<Self> {
        let now = Instant::now();
        let (outbound, outbound_rx) = match options.socket_path {
            Some(_) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let inner = Arc::new(Inner {
            savepoints: Mutex::new(Savepoints::unvalidated(&options)),
            state: Mutex::new(FileState {
                index: 0,
                file_name: String::new(),
                buffer: Vec::new(),
                last_buffer_save: now,
                last_rotation: now,
            }),
            data_writer: TargetWriter::spawn(TargetKind::Data),
            backup_writer: TargetWriter::spawn(TargetKind::Backup),
            outbound,
            socket_ready: Arc::new(Notify::new()),
            last_announcement: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            options,
            probe,
        });
        let handler = DataHandler { inner };

        handler.generate_savepoints().await;
        handler.generate_filename();
        handler.spawn_background(outbound_rx);

        Ok(handler)
    }

    fn spawn_background(&self, outbound_rx: Option<mpsc::UnboundedReceiver<Bytes>>) {
        let weak = Arc::downgrade(&self.inner);
        let mut tasks = vec![tokio::spawn(housekeeping_loop(weak.clone()))];

        if let (Some(rx), Some(path)) = (outbound_rx, self.inner.options.socket_path.clone()) {
            tasks.push(tokio::spawn(liveness_loop(
                weak.clone(),
                self.inner.options.socket_check_interval,
            )));
            tasks.push(tokio::spawn(outbound_loop(
                weak,
                rx,
                path,
                Arc::clone(&self.inner.socket_ready),
            )));
        }

        if !self.inner.options.recording_time.is_zero() {
            info!(
                "{} rotating files every {}s",
                self.inner.options.sensor_name,
                self.inner.options.recording_time.as_secs()
            );
        }
        lock(&self.inner.tasks).extend(tasks);
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| DataHandler { inner })
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.inner.options
    }

    /// Snapshot of the last validation pass
    pub fn savepoints(&self) -> Savepoints {
        lock(&self.inner.savepoints).clone()
    }

    /// `true` while writes are being forwarded to the channel
    pub fn channel_active(&self) -> bool {
        lock(&self.inner.savepoints).channel_active()
    }

    /// Name of the file currently receiving flushes
    pub fn current_file_name(&self) -> String {
        lock(&self.inner.state).file_name.clone()
    }

    /// Number of writes waiting for the next flush
    pub fn buffered_len(&self) -> usize {
        lock(&self.inner.state).buffer.len()
    }

    /// Recompute `mounted`/`exists` for every target
    pub async fn validate_savepoints(&self) -> Savepoints {
        let options = &self.inner.options;
        let needs_drives = is_removable(&options.data_path, &options.removable_prefixes)
            || is_removable(&options.backup_path, &options.removable_prefixes);

        let drives = if needs_drives {
            let probe = Arc::clone(&self.inner.probe);
            tokio::task::spawn_blocking(move || probe.usb_drives())
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let data = validate_directory(
            TargetKind::Data,
            &options.data_path,
            &options.removable_prefixes,
            &drives,
        );
        let backup = validate_directory(
            TargetKind::Backup,
            &options.backup_path,
            &options.removable_prefixes,
            &drives,
        );
        let socket = match &options.socket_path {
            Some(path) => Some(validate_socket(path).await),
            None => None,
        };
        let fresh = Savepoints { data, backup, socket };

        let previous = std::mem::replace(&mut *lock(&self.inner.savepoints), fresh.clone());
        self.report_changes(&previous, &fresh);
        fresh
    }

    fn report_changes(&self, previous: &Savepoints, fresh: &Savepoints) {
        let name = &self.inner.options.sensor_name;
        for (before, after) in [(&previous.data, &fresh.data), (&previous.backup, &fresh.backup)] {
            match (before.is_writable(), after.is_writable()) {
                (true, false) => warn!(
                    "{} {} path {} unavailable (mounted: {}, exists: {})",
                    name,
                    after.kind,
                    after.path.display(),
                    after.mounted,
                    after.exists
                ),
                (false, true) => info!("{} {} path {} available", name, after.kind, after.path.display()),
                _ => {}
            }
        }

        match (previous.channel_active(), fresh.channel_active()) {
            (false, true) => {
                info!("{} channel established, writing data to socket", name);
                self.inner.socket_ready.notify_one();
            }
            (true, false) => warn!("{} channel lost, buffering data locally", name),
            _ => {}
        }
    }

    /// Validate, create missing directories on mounted targets, validate again
    pub async fn generate_savepoints(&self) -> Savepoints {
        let savepoints = self.validate_savepoints().await;

        for target in [&savepoints.data, &savepoints.backup] {
            if target.mounted && !target.exists {
                match tokio::fs::create_dir_all(&target.path).await {
                    Ok(()) => info!("Created {} directory {}", target.kind, target.path.display()),
                    Err(e) => warn!(
                        "Failed to create {} directory {}: {}",
                        target.kind,
                        target.path.display(),
                        e
                    ),
                }
            }
        }

        self.validate_savepoints().await
    }

    /// Switch to a new timestamped file with the next index
    pub fn generate_filename(&self) -> String {
        let mut state = lock(&self.inner.state);
        self.next_file_name(&mut state)
    }

    fn next_file_name(&self, state: &mut FileState) -> String {
        let options = &self.inner.options;
        state.index += 1;
        state.file_name = file_name(&options.sensor_name, &options.extension, state.index, Local::now());
        info!("{} creating new file {}", options.sensor_name, state.file_name);
        state.file_name.clone()
    }

    /// Record one sensor write
    ///
    /// Forwarded to the channel when a consumer is listening, buffered for
    /// the directory targets otherwise.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::NoValidTarget` if the channel is inactive and
    /// neither directory target accepts writes. Failures of an individual
    /// target are logged and trigger revalidation instead.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use payload_daq::storage::{DataHandler, FlushPolicy, HandlerOptions};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let options = HandlerOptions::new("imu", ".csv", "/home/pi/data/imu", "/mnt/usb/imu");
    ///     let handler = DataHandler::new(options).await?;
    ///     handler.write_data("0.01,0.02,9.81\n", FlushPolicy::Buffered).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn write_data(&self, payload: impl Into<Payload>, policy: FlushPolicy) -> Result<()> {
        let mut data = payload.into().into_bytes();
        if data.is_empty() {
            return Ok(());
        }

        if self.channel_active() {
            if let Some(outbound) = &self.inner.outbound {
                self.announce_channel();
                match outbound.send(data) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(returned)) => data = returned,
                }
            }
        }

        let savepoints = self.savepoints();
        if !savepoints.any_directory_writable() {
            return Err(DaqError::NoValidTarget(format!(
                "{}: data path {} and backup path {} unavailable",
                self.inner.options.sensor_name,
                savepoints.data.path.display(),
                savepoints.backup.path.display()
            )));
        }

        let pending = {
            let mut state = lock(&self.inner.state);
            state.buffer.push(data);

            let due = state.last_buffer_save.elapsed() >= self.inner.options.buffer_interval;
            if !due && policy == FlushPolicy::Buffered {
                return Ok(());
            }
            if policy == FlushPolicy::NewFile {
                self.next_file_name(&mut state);
            }
            self.submit_buffer(&mut state, &savepoints)
        };

        self.await_writes(pending).await;
        Ok(())
    }

    /// Write everything buffered to the current file now
    ///
    /// # Errors
    ///
    /// Returns `DaqError::NoValidTarget` if data is buffered but no directory
    /// target accepts writes; the buffer is kept in that case.
    pub async fn flush(&self) -> Result<()> {
        let savepoints = self.savepoints();
        let pending = {
            let mut state = lock(&self.inner.state);
            if state.buffer.is_empty() {
                return Ok(());
            }
            if !savepoints.any_directory_writable() {
                return Err(DaqError::NoValidTarget(format!(
                    "{}: {} buffered writes have nowhere to go",
                    self.inner.options.sensor_name,
                    state.buffer.len()
                )));
            }
            self.submit_buffer(&mut state, &savepoints)
        };

        self.await_writes(pending).await;
        Ok(())
    }

    async fn flush_if_due(&self) {
        let due = {
            let state = lock(&self.inner.state);
            !state.buffer.is_empty() && state.last_buffer_save.elapsed() >= self.inner.options.buffer_interval
        };
        if due {
            if let Err(e) = self.flush().await {
                debug!("Deferred flush skipped: {}", e);
            }
        }
    }

    /// Hand the buffer to the writer tasks; called with the state lock held
    /// so submission order matches append order
    fn submit_buffer(
        &self,
        state: &mut FileState,
        savepoints: &Savepoints,
    ) -> Vec<(PathBuf, WriteCompletion)> {
        let data = serialize_buffer(&state.buffer, self.inner.options.record_mode);
        debug!(
            "{} writing {} buffered writes ({} bytes) to {}",
            self.inner.options.sensor_name,
            state.buffer.len(),
            data.len(),
            state.file_name
        );
        state.buffer.clear();
        state.last_buffer_save = Instant::now();

        let mut pending = Vec::with_capacity(2);
        for (target, writer) in [
            (&savepoints.data, &self.inner.data_writer),
            (&savepoints.backup, &self.inner.backup_writer),
        ] {
            if target.is_writable() {
                let path = target.path.join(&state.file_name);
                pending.push((path.clone(), writer.submit(path, data.clone())));
            }
        }
        pending
    }

    async fn await_writes(&self, pending: Vec<(PathBuf, WriteCompletion)>) {
        let mut failed = false;
        for (path, completion) in pending {
            if let Err(e) = writer::wait(completion).await {
                warn!("Failed to write to file {}: {}", path.display(), e);
                failed = true;
            }
        }
        if failed {
            self.validate_savepoints().await;
        }
    }

    /// Move an unsent message and everything queued behind it back into the
    /// local buffer, keeping send order
    fn reclaim_outbound(&self, unsent: Option<Bytes>, rx: &mut mpsc::UnboundedReceiver<Bytes>) {
        let mut state = lock(&self.inner.state);
        let before = state.buffer.len();
        state.buffer.extend(unsent);
        while let Ok(queued) = rx.try_recv() {
            state.buffer.push(queued);
        }
        let reclaimed = state.buffer.len() - before;
        if reclaimed > 0 {
            debug!(
                "{} kept {} channel writes in the local buffer",
                self.inner.options.sensor_name, reclaimed
            );
        }
    }

    fn announce_channel(&self) {
        let mut last = lock(&self.inner.last_announcement);
        let due = last.map_or(true, |at| at.elapsed() >= self.inner.options.buffer_interval);
        if due {
            info!(
                "{} channel valid, sending data to {}",
                self.inner.options.sensor_name,
                self.inner
                    .options
                    .socket_path
                    .as_deref()
                    .map(Path::display)
                    .map(|path| path.to_string())
                    .unwrap_or_default()
            );
            *last = Some(Instant::now());
        }
    }

    /// Rotate to a new file if the recording time has elapsed at `now`
    ///
    /// Rotation is skipped while the channel is the active sink and when the
    /// recording time is zero. Returns `true` if a new file was started.
    pub async fn rotate_if_due(&self, now: Instant) -> bool {
        let recording_time = self.inner.options.recording_time;
        if recording_time.is_zero() || self.channel_active() {
            return false;
        }

        {
            let mut state = lock(&self.inner.state);
            if now.saturating_duration_since(state.last_rotation) < recording_time {
                return false;
            }
            state.last_rotation = now;
            self.next_file_name(&mut state);
        }

        self.validate_savepoints().await;
        true
    }
}

async fn housekeeping_loop(weak: Weak<Inner>) {
    let mut tick = interval_at(Instant::now() + HOUSEKEEPING_TICK, HOUSEKEEPING_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Scheduled tick time, so rotations stay exactly one recording time apart
        let now = tick.tick().await;
        let Some(handler) = DataHandler::upgrade(&weak) else {
            return;
        };
        handler.rotate_if_due(now).await;
        handler.flush_if_due().await;
    }
}

async fn liveness_loop(weak: Weak<Inner>, period: Duration) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tick.tick().await;
        let Some(handler) = DataHandler::upgrade(&weak) else {
            return;
        };
        if !handler.channel_active() {
            handler.validate_savepoints().await;
        }
    }
}

async fn outbound_loop(
    weak: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    socket_path: PathBuf,
    socket_ready: Arc<Notify>,
) {
    loop {
        loop {
            match DataHandler::upgrade(&weak) {
                Some(handler) if handler.channel_active() => break,
                // Sends that raced with the channel going down
                Some(handler) => handler.reclaim_outbound(None, &mut rx),
                None => return,
            }
            tokio::select! {
                _ = socket_ready.notified() => {}
                _ = sleep(OUTBOUND_RETRY) => {}
            }
        }

        let mut client = match ChannelClient::connect(&socket_path).await {
            Ok(client) => client,
            Err(e) => {
                warn!("{}", e);
                let Some(handler) = DataHandler::upgrade(&weak) else {
                    return;
                };
                handler.reclaim_outbound(None, &mut rx);
                handler.validate_savepoints().await;
                sleep(OUTBOUND_RETRY).await;
                continue;
            }
        };
        debug!("Outbound channel connected to {}", socket_path.display());

        loop {
            let Some(data) = rx.recv().await else {
                return;
            };
            if let Err(e) = client.send(&data).await {
                warn!("Failed to write to socket: {}", e);
                let Some(handler) = DataHandler::upgrade(&weak) else {
                    return;
                };
                handler.reclaim_outbound(Some(data), &mut rx);
                handler.validate_savepoints().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ChannelOptions, ChannelServer, DeliveryMode};
    use mount::{MockMountProbe, MountKind, UsbDrive};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn no_drives() -> Arc<dyn MountProbe> {
        let mut probe = MockMountProbe::new();
        probe.expect_usb_drives().returning(Vec::new);
        Arc::new(probe)
    }

    fn options_in(dir: &TempDir) -> HandlerOptions {
        let mut options = HandlerOptions::new(
            "imu",
            ".bin",
            dir.path().join("sd/imu"),
            dir.path().join("usb/imu"),
        );
        options.removable_prefixes = vec![dir.path().join("usb")];
        options.buffer_interval = Duration::from_secs(3600);
        options
    }

    fn probe_with_drive(dir: &TempDir, plugged: Arc<AtomicBool>) -> Arc<dyn MountProbe> {
        let drive = UsbDrive {
            device_node: PathBuf::from("/dev/sda1"),
            vendor: "SanDisk".to_string(),
            model: "Ultra".to_string(),
            current_mount: Some(dir.path().join("usb")),
            fstab_mount: None,
            mount_kind: MountKind::Active,
        };
        let mut probe = MockMountProbe::new();
        probe.expect_usb_drives().returning(move || {
            if plugged.load(Ordering::SeqCst) {
                vec![drive.clone()]
            } else {
                Vec::new()
            }
        });
        Arc::new(probe)
    }

    fn read_target(handler: &DataHandler, target: &StorageTarget) -> Vec<u8> {
        std::fs::read(target.path.join(handler.current_file_name())).unwrap_or_default()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_file_name_format() {
        use chrono::TimeZone;
        let at = Local.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(file_name("gps", ".txt", 1, at), "gps_data_20250102_030405_1.txt");
        assert_eq!(file_name("event", "", 12, at), "event_data_20250102_030405_12");
    }

    #[test]
    fn test_payload_normalisation() {
        assert_eq!(Payload::from("abc").into_bytes(), Bytes::from_static(b"abc"));
        assert_eq!(Payload::from(vec!["ab".to_string(), "c".to_string()]).len(), 3);
        assert_eq!(
            Payload::from(vec![vec![1u8, 2], vec![3]]).into_bytes(),
            Bytes::from_static(&[1, 2, 3])
        );
        assert_eq!(
            Payload::from(&["$GNGLL", ",A\r\n"][..]).into_bytes(),
            Bytes::from_static(b"$GNGLL,A\r\n")
        );
        assert!(Payload::from(Vec::<Bytes>::new()).is_empty());
    }

    #[test]
    fn test_serialize_record_mode() {
        let buffer = vec![Bytes::from_static(b"ab"), Bytes::new(), Bytes::from_static(b"xyz")];
        assert_eq!(serialize_buffer(&buffer, false), Bytes::from_static(b"abxyz"));
        assert_eq!(
            serialize_buffer(&buffer, true),
            Bytes::from_static(b"\x02\x00\x00\x00ab\x00\x00\x00\x00\x03\x00\x00\x00xyz")
        );
    }

    #[tokio::test]
    async fn test_creates_directories_and_first_file_name() {
        let dir = TempDir::new().unwrap();
        let plugged = Arc::new(AtomicBool::new(true));
        let handler = DataHandler::with_probe(options_in(&dir), probe_with_drive(&dir, plugged))
            .await
            .unwrap();

        let savepoints = handler.savepoints();
        assert!(savepoints.data.is_writable());
        assert!(savepoints.backup.is_writable());
        assert!(savepoints.socket.is_none());
        assert!(handler.current_file_name().starts_with("imu_data_"));
        assert!(handler.current_file_name().ends_with("_1.bin"));
    }

    #[tokio::test]
    async fn test_dual_write_exactly_once() {
        let dir = TempDir::new().unwrap();
        let plugged = Arc::new(AtomicBool::new(true));
        let handler = DataHandler::with_probe(options_in(&dir), probe_with_drive(&dir, plugged))
            .await
            .unwrap();

        handler.write_data("first,", FlushPolicy::Buffered).await.unwrap();
        handler.write_data(vec![0u8, 1, 2], FlushPolicy::Buffered).await.unwrap();
        assert_eq!(handler.buffered_len(), 2);
        handler.write_data(",last", FlushPolicy::Immediate).await.unwrap();
        assert_eq!(handler.buffered_len(), 0);

        let savepoints = handler.savepoints();
        let expected = b"first,\x00\x01\x02,last".to_vec();
        assert_eq!(read_target(&handler, &savepoints.data), expected);
        assert_eq!(read_target(&handler, &savepoints.backup), expected);
    }

    #[tokio::test]
    async fn test_buffered_until_flush() {
        let dir = TempDir::new().unwrap();
        let handler = DataHandler::with_probe(options_in(&dir), no_drives()).await.unwrap();

        handler.write_data("pending", FlushPolicy::Buffered).await.unwrap();
        let savepoints = handler.savepoints();
        assert!(read_target(&handler, &savepoints.data).is_empty());

        handler.flush().await.unwrap();
        assert_eq!(read_target(&handler, &savepoints.data), b"pending");
        // nothing buffered, nothing written
        handler.flush().await.unwrap();
        assert_eq!(read_target(&handler, &savepoints.data), b"pending");
    }

    #[tokio::test]
    async fn test_zero_buffer_interval_flushes_every_write() {
        let dir = TempDir::new().unwrap();
        let mut options = options_in(&dir);
        options.buffer_interval = Duration::ZERO;
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();

        handler.write_data("a", FlushPolicy::Buffered).await.unwrap();
        handler.write_data("b", FlushPolicy::Buffered).await.unwrap();
        assert_eq!(read_target(&handler, &handler.savepoints().data), b"ab");
    }

    #[tokio::test]
    async fn test_new_file_policy_advances_index() {
        let dir = TempDir::new().unwrap();
        let handler = DataHandler::with_probe(options_in(&dir), no_drives()).await.unwrap();
        let first = handler.current_file_name();

        handler.write_data("old", FlushPolicy::Immediate).await.unwrap();
        handler.write_data("new", FlushPolicy::NewFile).await.unwrap();

        let second = handler.current_file_name();
        assert_ne!(first, second);
        assert!(second.ends_with("_2.bin"));

        let data_dir = handler.savepoints().data.path;
        assert_eq!(std::fs::read(data_dir.join(&first)).unwrap(), b"old");
        assert_eq!(std::fs::read(data_dir.join(&second)).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_record_mode_frames_each_write() {
        let dir = TempDir::new().unwrap();
        let mut options = options_in(&dir);
        options.record_mode = true;
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();

        handler.write_data("one", FlushPolicy::Buffered).await.unwrap();
        handler.write_data("three", FlushPolicy::Immediate).await.unwrap();

        assert_eq!(
            read_target(&handler, &handler.savepoints().data),
            b"\x03\x00\x00\x00one\x05\x00\x00\x00three".to_vec()
        );
    }

    #[tokio::test]
    async fn test_no_valid_target_fails_loudly() {
        let dir = TempDir::new().unwrap();
        let mut options = options_in(&dir);
        options.data_path = dir.path().join("usb/sd");
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();

        let savepoints = handler.savepoints();
        assert!(!savepoints.data.mounted);
        assert!(!savepoints.backup.mounted);

        let result = handler.write_data("lost?", FlushPolicy::Immediate).await;
        assert!(matches!(result, Err(DaqError::NoValidTarget(_))));
        assert_eq!(handler.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_backup_unmounted_mid_run() {
        let dir = TempDir::new().unwrap();
        let plugged = Arc::new(AtomicBool::new(true));
        let handler = DataHandler::with_probe(options_in(&dir), probe_with_drive(&dir, Arc::clone(&plugged)))
            .await
            .unwrap();
        let savepoints = handler.savepoints();

        handler.write_data("A", FlushPolicy::Immediate).await.unwrap();
        assert_eq!(read_target(&handler, &savepoints.backup), b"A");

        plugged.store(false, Ordering::SeqCst);
        std::fs::remove_dir_all(dir.path().join("usb")).unwrap();

        handler.write_data("B", FlushPolicy::Immediate).await.unwrap();
        assert!(!handler.savepoints().backup.mounted);
        handler.write_data("C", FlushPolicy::Immediate).await.unwrap();

        assert_eq!(read_target(&handler, &savepoints.data), b"ABC");
        assert!(!savepoints.backup.path.exists());
    }

    #[tokio::test]
    async fn test_backup_returns_after_replug() {
        let dir = TempDir::new().unwrap();
        let plugged = Arc::new(AtomicBool::new(false));
        let handler = DataHandler::with_probe(options_in(&dir), probe_with_drive(&dir, Arc::clone(&plugged)))
            .await
            .unwrap();
        assert!(!handler.savepoints().backup.is_writable());

        plugged.store(true, Ordering::SeqCst);
        let savepoints = handler.generate_savepoints().await;
        assert!(savepoints.backup.is_writable());

        handler.write_data("back", FlushPolicy::Immediate).await.unwrap();
        assert_eq!(read_target(&handler, &savepoints.backup), b"back");
    }

    #[tokio::test]
    async fn test_rotation_once_per_interval() {
        let dir = TempDir::new().unwrap();
        let mut options = options_in(&dir);
        options.recording_time = Duration::from_secs(300);
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();
        let start = Instant::now();
        let first = handler.current_file_name();

        assert!(!handler.rotate_if_due(start + Duration::from_secs(299)).await);
        assert_eq!(handler.current_file_name(), first);

        assert!(handler.rotate_if_due(start + Duration::from_secs(301)).await);
        let second = handler.current_file_name();
        assert!(second.ends_with("_2.bin"));

        assert!(!handler.rotate_if_due(start + Duration::from_secs(400)).await);
        assert!(handler.rotate_if_due(start + Duration::from_secs(601)).await);
        assert!(handler.current_file_name().ends_with("_3.bin"));
    }

    #[tokio::test]
    async fn test_zero_recording_time_never_rotates() {
        let dir = TempDir::new().unwrap();
        let handler = DataHandler::with_probe(options_in(&dir), no_drives()).await.unwrap();
        let first = handler.current_file_name();
        assert!(!handler.rotate_if_due(Instant::now() + Duration::from_secs(86_400)).await);
        assert_eq!(handler.current_file_name(), first);
    }

    #[tokio::test]
    async fn test_channel_redirect_and_fallback() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("imu.sock");
        let server = ChannelServer::bind("imu", &socket, DeliveryMode::Fifo, ChannelOptions::default()).unwrap();

        let mut options = options_in(&dir);
        options.socket_path = Some(socket.clone());
        options.recording_time = Duration::from_secs(3600);
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();
        assert!(handler.channel_active());

        handler.write_data("to consumer", FlushPolicy::Immediate).await.unwrap();
        let message = server.recv_timeout(Duration::from_secs(2)).await;
        assert_eq!(message.as_deref(), Some(&b"to consumer"[..]));
        assert_eq!(handler.buffered_len(), 0);
        assert!(read_target(&handler, &handler.savepoints().data).is_empty());
        // no rotation while the channel is the sink
        assert!(!handler.rotate_if_due(Instant::now() + Duration::from_secs(7200)).await);

        drop(server);
        sleep(Duration::from_millis(50)).await;

        handler.write_data("stranded", FlushPolicy::Buffered).await.unwrap();
        wait_until(|| !handler.channel_active()).await;
        assert_eq!(handler.buffered_len(), 1);

        handler.flush().await.unwrap();
        assert_eq!(read_target(&handler, &handler.savepoints().data), b"stranded");
    }

    #[tokio::test]
    async fn test_channel_reconnects_when_consumer_returns() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("gps.sock");

        let mut options = options_in(&dir);
        options.socket_path = Some(socket.clone());
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();
        assert!(!handler.channel_active());

        handler.write_data("local", FlushPolicy::Immediate).await.unwrap();
        assert_eq!(read_target(&handler, &handler.savepoints().data), b"local");

        let server = ChannelServer::bind("gps", &socket, DeliveryMode::Fifo, ChannelOptions::default()).unwrap();
        handler.validate_savepoints().await;
        assert!(handler.channel_active());

        handler.write_data("remote", FlushPolicy::Immediate).await.unwrap();
        let message = server.recv_timeout(Duration::from_secs(3)).await;
        assert_eq!(message.as_deref(), Some(&b"remote"[..]));
    }

    #[tokio::test]
    async fn test_write_kept_when_consumer_vanishes_before_connect() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("gps.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let mut options = options_in(&dir);
        options.socket_path = Some(socket.clone());
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();
        assert!(handler.channel_active());

        drop(listener);
        std::fs::remove_file(&socket).unwrap();

        handler.write_data("epoch-1", FlushPolicy::Buffered).await.unwrap();
        wait_until(|| !handler.channel_active() && handler.buffered_len() == 1).await;

        handler.flush().await.unwrap();
        assert_eq!(read_target(&handler, &handler.savepoints().data), b"epoch-1");
    }

    #[tokio::test]
    async fn test_liveness_timer_switches_to_returning_consumer() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("imu.sock");

        let mut options = options_in(&dir);
        options.socket_path = Some(socket.clone());
        options.socket_check_interval = Duration::from_millis(50);
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();
        assert!(!handler.channel_active());

        let server = ChannelServer::bind("imu", &socket, DeliveryMode::Fifo, ChannelOptions::default()).unwrap();
        wait_until(|| handler.channel_active()).await;

        handler.write_data("sample", FlushPolicy::Immediate).await.unwrap();
        let message = server.recv_timeout(Duration::from_secs(3)).await;
        assert_eq!(message.as_deref(), Some(&b"sample"[..]));
    }

    #[tokio::test]
    async fn test_background_rotation_once_per_recording_time() {
        let dir = TempDir::new().unwrap();
        let mut options = options_in(&dir);
        options.recording_time = Duration::from_secs(1);
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();
        assert!(handler.current_file_name().ends_with("_1.bin"));

        let mut changes: Vec<(String, Instant)> = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && changes.len() < 2 {
            let name = handler.current_file_name();
            if changes.last().map_or(!name.ends_with("_1.bin"), |(last, _)| *last != name) {
                changes.push((name, Instant::now()));
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(changes.len(), 2, "expected two rotations, saw {:?}", changes);
        assert!(changes[0].0.ends_with("_2.bin"));
        assert!(changes[1].0.ends_with("_3.bin"));
        let gap = changes[1].1 - changes[0].1;
        assert!(gap >= Duration::from_millis(800), "rotations only {:?} apart", gap);
    }

    #[tokio::test]
    async fn test_quiet_buffer_flushed_by_housekeeping() {
        let dir = TempDir::new().unwrap();
        let mut options = options_in(&dir);
        options.buffer_interval = Duration::from_millis(500);
        let handler = DataHandler::with_probe(options, no_drives()).await.unwrap();

        handler.write_data("quiet", FlushPolicy::Buffered).await.unwrap();
        assert_eq!(handler.buffered_len(), 1);
        let data = handler.savepoints().data;
        assert!(read_target(&handler, &data).is_empty());

        wait_until(|| read_target(&handler, &data) == b"quiet").await;
        assert_eq!(handler.buffered_len(), 0);
    }
}
