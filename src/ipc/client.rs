//! Producer side of a sensor channel

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::debug;

use super::frame::EOT_SENTINEL;
use crate::error::{DaqError, Result};

/// Connected producer for one channel socket
#[derive(Debug)]
pub struct ChannelClient {
    stream: UnixStream,
    socket_path: PathBuf,
}

impl ChannelClient {
    /// Connect to a listening channel server
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Channel` if nothing is listening at `socket_path`
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            DaqError::Channel(format!("Failed to connect to {}: {}", socket_path.display(), e))
        })?;
        debug!("Connected to {}", socket_path.display());

        Ok(Self {
            stream,
            socket_path,
        })
    }

    /// Send one message followed by the sentinel
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Channel` if the peer has gone away
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.write_all(payload).await?;
        self.write_all(EOT_SENTINEL).await?;
        self.stream
            .flush()
            .await
            .map_err(|e| self.channel_error("flush", e))
    }

    /// Path this client is connected to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self.stream.write_all(data).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.channel_error("write", e)),
        }
    }

    fn channel_error(&self, op: &str, e: std::io::Error) -> DaqError {
        DaqError::Channel(format!(
            "Failed to {} {}: {}",
            op,
            self.socket_path.display(),
            e
        ))
    }
}

/// `true` if a server is accepting connections at `socket_path`
///
/// The probe connection is closed immediately; the server sees a connect
/// followed by a clean disconnect.
pub async fn probe(socket_path: impl AsRef<Path>) -> bool {
    match UnixStream::connect(socket_path.as_ref()).await {
        Ok(mut stream) => {
            let _ = stream.shutdown().await;
            true
        }
        Err(_) => false,
    }
}
