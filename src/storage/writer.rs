//! # Target Writer
//!
//! One long-lived task per storage target. Flushes are queued to it and the
//! caller receives a completion signal, so the data and backup targets are
//! written concurrently and a slow target only delays its own completion.

use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

use super::target::TargetKind;

struct WriteJob {
    path: PathBuf,
    data: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

/// Pending completion of a queued write
pub type WriteCompletion = oneshot::Receiver<io::Result<()>>;

/// Append-only writer task for one target
#[derive(Debug)]
pub struct TargetWriter {
    kind: TargetKind,
    jobs: mpsc::UnboundedSender<WriteJob>,
    task: JoinHandle<()>,
}

impl TargetWriter {
    /// Start the writer task (requires a Tokio runtime)
    pub fn spawn(kind: TargetKind) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(writer_loop(kind, rx));
        Self { kind, jobs, task }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Queue `data` to be appended to `path`
    pub fn submit(&self, path: PathBuf, data: Bytes) -> WriteCompletion {
        let (done, completion) = oneshot::channel();
        // A send failure drops `done`, which the caller observes as a closed completion
        let _ = self.jobs.send(WriteJob { path, data, done });
        completion
    }

    /// Append `data` to `path` and wait for the result
    pub async fn write(&self, path: PathBuf, data: Bytes) -> io::Result<()> {
        wait(self.submit(path, data)).await
    }
}

impl Drop for TargetWriter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolve a completion, mapping a vanished writer task to an I/O error
pub async fn wait(completion: WriteCompletion) -> io::Result<()> {
    completion
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer task stopped")))
}

async fn writer_loop(kind: TargetKind, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
    while let Some(job) = jobs.recv().await {
        let result = append(&job.path, &job.data).await;
        trace!("{} writer appended {} bytes to {}", kind, job.data.len(), job.path.display());
        let _ = job.done.send(result);
    }
}

async fn append(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_data().await
}
