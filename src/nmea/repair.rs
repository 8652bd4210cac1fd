//! # NMEA Packet Repair
//!
//! Bounded brute-force repair of sentences in which the link layer replaced
//! corrupted bytes with 0x7F. Every combination of replacement characters
//! from the printable band `[',', 'Z']` is tried at the marked positions
//! until one satisfies the checksum.
//!
//! The search space is `47^n` for `n` corrupted positions, so callers keep
//! `repair_limit` at 1 or 2.

use super::checksum::{checksum_validator, payload_range, NMEA_CORRUPTION_MARKER};
use super::odometer::Odometer;

/// Lowest replacement candidate (`,`)
pub const REPAIR_BOTTOM_ASCII: u8 = b',';

/// Highest replacement candidate (`Z`)
pub const REPAIR_TOP_ASCII: u8 = b'Z';

/// Number of replacement candidates per corrupted position
pub const REPAIR_SYMBOL_COUNT: usize = (REPAIR_TOP_ASCII - REPAIR_BOTTOM_ASCII) as usize + 1;

/// Default number of corrupted bytes a packet may carry and still be repaired
pub const DEFAULT_REPAIR_LIMIT: usize = 1;

/// Result of a repair attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Repaired packet, or the input unchanged if no repair was made
    pub packet: Vec<u8>,

    /// Checksum validates
    pub valid: bool,

    /// At least one corrupted byte was substituted
    pub repaired: bool,
}

impl RepairOutcome {
    fn unchanged(packet: &[u8], valid: bool) -> Self {
        Self {
            packet: packet.to_vec(),
            valid,
            repaired: false,
        }
    }
}

/// Positions of corruption markers inside the checksummed payload
pub fn corrupted_positions(packet: &[u8]) -> Vec<usize> {
    let Some(range) = payload_range(packet) else {
        return Vec::new();
    };

    range
        .filter(|&index| packet[index] == NMEA_CORRUPTION_MARKER)
        .collect()
}

/// Attempt to validate and, if needed, repair an NMEA sentence
///
/// # Arguments
///
/// * `packet` - Raw sentence, with or without `\r\n`
/// * `repair_limit` - Maximum number of corrupted positions to search over
///
/// # Returns
///
/// * `RepairOutcome` - First candidate (in odometer order, rightmost position
///   fastest) whose checksum validates, or the original packet marked invalid
///
/// # Examples
///
/// ```
/// use payload_daq::nmea::packet_repairer;
///
/// let outcome = packet_repairer(b"$GPGLL,\x7F*3D", 1);
/// assert!(outcome.valid && outcome.repaired);
/// assert_eq!(outcome.packet, b"$GPGLL,A*3D");
/// ```
pub fn packet_repairer(packet: &[u8], repair_limit: usize) -> RepairOutcome {
    let errors = corrupted_positions(packet);

    if errors.is_empty() {
        return RepairOutcome::unchanged(packet, checksum_validator(packet));
    }

    if errors.len() > repair_limit {
        return RepairOutcome::unchanged(packet, false);
    }

    let mut candidate = packet.to_vec();
    let mut odometer = Odometer::uniform(errors.len(), REPAIR_SYMBOL_COUNT);

    loop {
        for (&position, &digit) in errors.iter().zip(odometer.digits()) {
            candidate[position] = REPAIR_BOTTOM_ASCII + digit as u8;
        }

        if checksum_validator(&candidate) {
            return RepairOutcome {
                packet: candidate,
                valid: true,
                repaired: true,
            };
        }

        if !odometer.advance() {
            break;
        }
    }

    RepairOutcome::unchanged(packet, false)
}
