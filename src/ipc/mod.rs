//! # Local IPC Channel
//!
//! Sentinel-framed message passing over Unix domain sockets, used to hand
//! sensor payloads from producer processes to the collator.
//!
//! This module handles:
//! - Framing: every message ends with the 5-byte trailer `EOT\x03\x04`
//! - A per-stream server owning one accepted connection at a time
//! - FIFO (bounded, drop-oldest) or accumulate-and-drain delivery
//! - A producer-side client and a connect-and-close reachability probe

pub mod client;
pub mod frame;
pub mod server;

pub use client::{probe, ChannelClient};
pub use frame::{encode_message, FrameAccumulator, EOT_SENTINEL};
pub use server::{ChannelOptions, ChannelServer, DeliveryMode};
