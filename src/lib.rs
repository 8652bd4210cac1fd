//! # Payload DAQ Library
//!
//! Onboard data-acquisition backbone for an embedded sensor payload.
//!
//! This library provides the pieces every sensor process is built from:
//! resilient dual-target storage with IPC redirection, a sentinel-framed
//! Unix domain socket channel, a queue-based serial transceiver and a
//! brute-force NMEA packet repairer.

pub mod collator;
pub mod config;
pub mod error;
pub mod gps;
pub mod ipc;
pub mod logging;
pub mod nmea;
pub mod queue;
pub mod serial;
pub mod storage;
