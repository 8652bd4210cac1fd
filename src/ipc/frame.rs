//! # Channel Framing
//!
//! No length prefix: a message is any run of bytes followed by the
//! end-of-transmission sentinel. Receivers scan for the sentinel across
//! however many socket reads the message spans.

use bytes::{Buf, Bytes, BytesMut};

/// End-of-message trailer: `EOT` followed by ASCII ETX and EOT
pub const EOT_SENTINEL: &[u8; 5] = b"EOT\x03\x04";

/// Append the sentinel to a payload
///
/// # Examples
///
/// ```
/// use payload_daq::ipc::encode_message;
///
/// assert_eq!(&encode_message(b"fix")[..], b"fixEOT\x03\x04");
/// ```
pub fn encode_message(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + EOT_SENTINEL.len());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(EOT_SENTINEL);
    frame.freeze()
}

/// Reassembles sentinel-terminated messages from arbitrary read chunks
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: BytesMut,
    // Bytes before this offset are known not to start a sentinel
    scanned: usize,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every message it completes, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(offset) = find_sentinel(&self.buffer[self.scanned..]) {
            let end = self.scanned + offset;
            let message = self.buffer.split_to(end).freeze();
            self.buffer.advance(EOT_SENTINEL.len());
            self.scanned = 0;
            messages.push(message);
        }

        self.scanned = self.buffer.len().saturating_sub(EOT_SENTINEL.len() - 1);
        messages
    }

    /// Bytes received since the last complete message
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial message
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

fn find_sentinel(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(EOT_SENTINEL.len())
        .position(|window| window == EOT_SENTINEL)
}
