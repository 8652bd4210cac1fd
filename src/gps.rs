//! # GPS Logger
//!
//! Reads NMEA sentences from the receiver, repairs what can be repaired and
//! stores one epoch at a time. An epoch is every valid sentence up to and
//! including the configured closing sentence (`$GNGLL` on u-blox receivers).

use bytes::Bytes;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::config::GpsConfig;
use crate::error::Result;
use crate::nmea::packet_repairer;
use crate::serial::{LinkStats, Transceiver};
use crate::storage::{DataHandler, FlushPolicy};

/// How long one `run_once` waits for a sentence
const RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// Sentence counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpsStats {
    /// Sentences whose checksum matched as received
    pub sentences_valid: u64,
    /// Sentences recovered by repair
    pub sentences_repaired: u64,
    /// Sentences dropped as unrepairable
    pub sentences_dropped: u64,
    /// Epochs handed to the storage handler
    pub epochs_written: u64,
}

/// Serial GPS receiver feeding a storage handler
#[derive(Debug)]
pub struct GpsLogger {
    link: Transceiver,
    handler: DataHandler,
    repair_limit: usize,
    flush_sentence: Bytes,
    epoch: Vec<Bytes>,
    stats: GpsStats,
}

impl GpsLogger {
    pub fn new(link: Transceiver, handler: DataHandler, config: &GpsConfig) -> Self {
        Self {
            link,
            handler,
            repair_limit: config.repair_limit,
            flush_sentence: Bytes::copy_from_slice(config.flush_sentence.as_bytes()),
            epoch: Vec::new(),
            stats: GpsStats::default(),
        }
    }

    /// Handle one sentence (without line terminator)
    ///
    /// Returns `true` if the sentence closed an epoch that was then written.
    ///
    /// # Errors
    ///
    /// Propagates `DaqError::NoValidTarget` from the storage handler
    pub async fn process(&mut self, sentence: &[u8]) -> Result<bool> {
        let outcome = packet_repairer(sentence, self.repair_limit);
        if !outcome.valid {
            self.stats.sentences_dropped += 1;
            debug!("Dropping invalid sentence {:?}", String::from_utf8_lossy(sentence));
            return Ok(false);
        }

        if outcome.repaired {
            self.stats.sentences_repaired += 1;
            debug!("Repaired sentence {:?}", String::from_utf8_lossy(&outcome.packet));
        } else {
            self.stats.sentences_valid += 1;
        }

        let mut line = outcome.packet;
        line.extend_from_slice(b"\r\n");
        let closes_epoch = line.starts_with(&self.flush_sentence);
        self.epoch.push(Bytes::from(line));

        if closes_epoch {
            self.write_epoch().await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn write_epoch(&mut self) -> Result<()> {
        let epoch = std::mem::take(&mut self.epoch);
        self.handler.write_data(epoch, FlushPolicy::Buffered).await?;
        self.stats.epochs_written += 1;
        Ok(())
    }

    /// Wait up to `timeout` for a sentence and process it
    pub async fn run_once(&mut self, timeout: Duration) -> Result<bool> {
        match self.link.wait_for_data(timeout).await {
            Some(sentence) => self.process(&sentence).await,
            None => Ok(false),
        }
    }

    /// Log sentences until a storage error occurs
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting GPS logging from {}", self.link.device_path());
        loop {
            self.run_once(RECEIVE_WAIT).await?;
        }
    }

    /// Store any partial epoch and flush the handler
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.epoch.is_empty() {
            self.write_epoch().await?;
        }
        self.handler.flush().await?;
        info!(
            "GPS logger stopped: {} valid, {} repaired, {} dropped, {} epochs",
            self.stats.sentences_valid,
            self.stats.sentences_repaired,
            self.stats.sentences_dropped,
            self.stats.epochs_written
        );
        Ok(())
    }

    pub fn stats(&self) -> GpsStats {
        self.stats
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }

    /// Sentences buffered for the current epoch
    pub fn pending_sentences(&self) -> usize {
        self.epoch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::port_trait::mocks::MockSerialPort;
    use crate::serial::MAX_QUEUE_SIZE;
    use crate::storage::HandlerOptions;
    use tempfile::TempDir;

    const FIX: &[u8] = b"$GPGLL,4916.45,N,12311.12,W,225444,A*31";
    const CLOSE: &[u8] = b"$GNGLL,5109.0262,N,11401.8407,W,202725.00,A,D*65";

    async fn logger_in(dir: &TempDir) -> (GpsLogger, MockSerialPort, DataHandler) {
        let mut options = HandlerOptions::new("gps", ".txt", dir.path().join("data"), dir.path().join("backup"));
        options.removable_prefixes = Vec::new();
        options.buffer_interval = Duration::ZERO;
        let handler = DataHandler::new(options).await.unwrap();

        let mock = MockSerialPort::new();
        let link = Transceiver::with_port(Box::new(mock.clone()), "mock", MAX_QUEUE_SIZE);
        let logger = GpsLogger::new(link, handler.clone(), &GpsConfig::default());
        (logger, mock, handler)
    }

    fn stored(dir: &TempDir, handler: &DataHandler) -> Vec<u8> {
        std::fs::read(dir.path().join("data").join(handler.current_file_name())).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_epoch_written_on_closing_sentence() {
        let dir = TempDir::new().unwrap();
        let (mut logger, mock, handler) = logger_in(&dir).await;

        let mut wire = Vec::new();
        for sentence in [
            FIX,
            &b"$GPGLL,\x7F*3D"[..],
            &b"$GNGSA,A,3,2,20,06,,,,,,,,,,6.12,4.13,4.51,1*06"[..],
            CLOSE,
        ] {
            wire.extend_from_slice(sentence);
            wire.extend_from_slice(b"\r\n");
        }
        mock.inject(&wire);

        let mut closed = Vec::new();
        for _ in 0..4 {
            closed.push(logger.run_once(Duration::from_secs(1)).await.unwrap());
        }
        assert_eq!(closed, vec![false, false, false, true]);

        let mut expected = Vec::new();
        expected.extend_from_slice(FIX);
        expected.extend_from_slice(b"\r\n$GPGLL,A*3D\r\n");
        expected.extend_from_slice(CLOSE);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(stored(&dir, &handler), expected);

        assert_eq!(
            logger.stats(),
            GpsStats {
                sentences_valid: 2,
                sentences_repaired: 1,
                sentences_dropped: 1,
                epochs_written: 1,
            }
        );
        assert_eq!(logger.link_stats().messages_received, 4);
    }

    #[tokio::test]
    async fn test_partial_epoch_held_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let (mut logger, _mock, handler) = logger_in(&dir).await;

        assert!(!logger.process(FIX).await.unwrap());
        assert_eq!(logger.pending_sentences(), 1);
        assert!(stored(&dir, &handler).is_empty());

        logger.shutdown().await.unwrap();
        assert_eq!(logger.pending_sentences(), 0);

        let mut expected = FIX.to_vec();
        expected.extend_from_slice(b"\r\n");
        assert_eq!(stored(&dir, &handler), expected);
    }

    #[tokio::test]
    async fn test_two_corruptions_dropped_with_default_limit() {
        let dir = TempDir::new().unwrap();
        let (mut logger, _mock, _handler) = logger_in(&dir).await;

        assert!(!logger.process(b"$GPGLL,4916.45,\x7F,12311.12,\x7F,225444,A*31").await.unwrap());
        assert_eq!(logger.stats().sentences_dropped, 1);
        assert_eq!(logger.pending_sentences(), 0);
    }

    #[tokio::test]
    async fn test_run_once_times_out_quietly() {
        let dir = TempDir::new().unwrap();
        let (mut logger, _mock, _handler) = logger_in(&dir).await;
        assert!(!logger.run_once(Duration::from_millis(10)).await.unwrap());
        assert_eq!(logger.stats(), GpsStats::default());
    }
}
