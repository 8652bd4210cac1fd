//! # Channel Server
//!
//! One listener per sensor stream. The accept loop serves a single
//! connection until the peer closes it, then goes back to `accept()`, so a
//! producer that restarts is picked up without any coordination.

use bytes::Bytes;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::frame::FrameAccumulator;
use crate::error::{DaqError, Result};
use crate::queue::DropOldestQueue;

/// Default socket read size
pub const DEFAULT_BUFSIZE: usize = 4096;

/// Default number of messages a FIFO channel retains
pub const DEFAULT_FIFO_CAPACITY: usize = 16;

/// Back-off after a failed `accept()`
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// How completed messages are handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Bounded queue, oldest message dropped on overflow
    Fifo,
    /// Unbounded list drained wholesale by the consumer
    Accumulate,
}

/// Tuning for a channel server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Bytes requested per socket read
    pub bufsize: usize,
    /// FIFO capacity (ignored in accumulate mode)
    pub capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            bufsize: DEFAULT_BUFSIZE,
            capacity: DEFAULT_FIFO_CAPACITY,
        }
    }
}

#[derive(Debug)]
enum Inbox {
    Fifo(DropOldestQueue<Bytes>),
    Accumulate(Mutex<Vec<Bytes>>),
}

impl Inbox {
    fn new(mode: DeliveryMode, capacity: usize) -> Self {
        match mode {
            DeliveryMode::Fifo => Inbox::Fifo(DropOldestQueue::new(capacity)),
            DeliveryMode::Accumulate => Inbox::Accumulate(Mutex::new(Vec::new())),
        }
    }

    fn deliver(&self, name: &str, message: Bytes) {
        match self {
            Inbox::Fifo(queue) => {
                if queue.push(message).is_some() {
                    debug!("{} channel full, dropped oldest message", name);
                }
            }
            Inbox::Accumulate(list) => {
                list.lock().unwrap_or_else(PoisonError::into_inner).push(message);
            }
        }
    }
}

/// Unix domain socket server for one sensor stream
pub struct ChannelServer {
    name: String,
    socket_path: PathBuf,
    mode: DeliveryMode,
    inbox: Arc<Inbox>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ChannelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelServer")
            .field("name", &self.name)
            .field("socket_path", &self.socket_path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ChannelServer {
    /// Bind the socket and start the accept loop
    ///
    /// A stale socket file at `socket_path` is removed first. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Channel` if the socket cannot be bound
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use payload_daq::ipc::{ChannelOptions, ChannelServer, DeliveryMode};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let imu = ChannelServer::bind("imu", "/tmp/imu.sock", DeliveryMode::Accumulate, ChannelOptions::default())?;
    ///     for sample in imu.drain() {
    ///         println!("{:?}", sample);
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn bind(
        name: impl Into<String>,
        socket_path: impl AsRef<Path>,
        mode: DeliveryMode,
        options: ChannelOptions,
    ) -> Result<Self> {
        let name = name.into();
        let socket_path = socket_path.as_ref().to_path_buf();

        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!("Removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DaqError::Channel(format!(
                    "Failed to remove stale socket {}: {}",
                    socket_path.display(),
                    e
                )))
            }
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            DaqError::Channel(format!("Failed to bind {}: {}", socket_path.display(), e))
        })?;
        info!("{} channel listening on {}", name, socket_path.display());

        let inbox = Arc::new(Inbox::new(mode, options.capacity));
        let task = tokio::spawn(accept_loop(
            name.clone(),
            listener,
            Arc::clone(&inbox),
            options.bufsize.max(1),
        ));

        Ok(Self {
            name,
            socket_path,
            mode,
            inbox,
            task,
        })
    }

    /// Stream name used in log messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the bound socket
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Delivery mode chosen at bind time
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Take the oldest pending message without waiting
    pub fn try_recv(&self) -> Option<Bytes> {
        match self.inbox.as_ref() {
            Inbox::Fifo(queue) => queue.try_pop(),
            Inbox::Accumulate(list) => {
                let mut list = list.lock().unwrap_or_else(PoisonError::into_inner);
                if list.is_empty() {
                    None
                } else {
                    Some(list.remove(0))
                }
            }
        }
    }

    /// Take the oldest pending message, waiting up to `timeout`
    ///
    /// Only FIFO channels wait; an accumulate channel answers immediately.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
        match self.inbox.as_ref() {
            Inbox::Fifo(queue) => queue.pop_timeout(timeout).await,
            Inbox::Accumulate(_) => self.try_recv(),
        }
    }

    /// Take every pending message, oldest first
    pub fn drain(&self) -> Vec<Bytes> {
        match self.inbox.as_ref() {
            Inbox::Fifo(queue) => queue.drain(),
            Inbox::Accumulate(list) => {
                std::mem::take(&mut *list.lock().unwrap_or_else(PoisonError::into_inner))
            }
        }
    }

    /// Number of pending messages
    pub fn pending(&self) -> usize {
        match self.inbox.as_ref() {
            Inbox::Fifo(queue) => queue.len(),
            Inbox::Accumulate(list) => list.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    /// Messages evicted by FIFO overflow (always 0 in accumulate mode)
    pub fn dropped(&self) -> u64 {
        match self.inbox.as_ref() {
            Inbox::Fifo(queue) => queue.dropped(),
            Inbox::Accumulate(_) => 0,
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn accept_loop(name: String, listener: UnixListener, inbox: Arc<Inbox>, bufsize: usize) {
    let mut chunk = vec![0u8; bufsize];

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("{} socket accept failed: {}", name, e);
                sleep(ACCEPT_RETRY).await;
                continue;
            }
        };
        info!("{} socket connected", name);

        serve_connection(&name, stream, &inbox, &mut chunk).await;
    }
}

async fn serve_connection(name: &str, mut stream: UnixStream, inbox: &Inbox, chunk: &mut [u8]) {
    let mut accumulator = FrameAccumulator::new();

    loop {
        match stream.read(chunk).await {
            Ok(0) => {
                warn!("{} socket disconnected, waiting for reconnect", name);
                break;
            }
            Ok(count) => {
                for message in accumulator.push(&chunk[..count]) {
                    inbox.deliver(name, message);
                }
            }
            Err(e) => {
                warn!("{} socket read failed: {}", name, e);
                break;
            }
        }
    }

    if accumulator.pending_len() > 0 {
        debug!(
            "{} discarding {} bytes of unterminated message",
            name,
            accumulator.pending_len()
        );
    }
}
