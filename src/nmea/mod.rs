//! # NMEA Module
//!
//! Checksum validation and brute-force repair of NMEA 0183 sentences
//! received over a noisy serial link.
//!
//! This module handles:
//! - XOR checksum calculation and validation (`$...*HH`)
//! - Locating link-layer corruption markers (0x7F)
//! - Exhaustive repair of a bounded number of corrupted bytes

pub mod checksum;
pub mod odometer;
pub mod repair;

pub use checksum::checksum_validator;
pub use repair::{packet_repairer, RepairOutcome};
