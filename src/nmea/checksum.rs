//! # NMEA Checksum
//!
//! XOR checksum over the bytes between `$` and `*`, transmitted as two
//! uppercase hexadecimal ASCII digits.

/// Sentence start byte
pub const NMEA_START: u8 = b'$';

/// Byte separating the payload from the checksum digits
pub const NMEA_CHECKSUM_DELIMITER: u8 = b'*';

/// Byte the link layer substitutes for a corrupted position (ASCII DEL)
pub const NMEA_CORRUPTION_MARKER: u8 = 0x7F;

/// Length of the `*HH` trailer
const CHECKSUM_TRAILER_LEN: usize = 3;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Strip an optional `\r\n` (or bare `\r` / `\n`) terminator
///
/// # Examples
///
/// ```
/// use payload_daq::nmea::checksum::strip_terminator;
///
/// assert_eq!(strip_terminator(b"$GPGLL*00\r\n"), b"$GPGLL*00");
/// assert_eq!(strip_terminator(b"$GPGLL*00"), b"$GPGLL*00");
/// ```
pub fn strip_terminator(packet: &[u8]) -> &[u8] {
    let mut end = packet.len();
    while end > 0 && matches!(packet[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &packet[..end]
}

/// Byte range of the checksummed payload (strictly between `$` and `*`)
///
/// Returns `None` if the sentence is too short to carry a `$` and a `*HH`
/// trailer. The range indexes into `packet` itself, terminator included.
pub fn payload_range(packet: &[u8]) -> Option<std::ops::Range<usize>> {
    let body = strip_terminator(packet);
    if body.len() < 1 + CHECKSUM_TRAILER_LEN {
        return None;
    }
    Some(1..body.len() - CHECKSUM_TRAILER_LEN)
}

/// XOR every byte of a payload
pub fn compute_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &byte| acc ^ byte)
}

/// Format a checksum as two uppercase hexadecimal ASCII digits
pub fn checksum_digits(checksum: u8) -> [u8; 2] {
    [
        HEX_DIGITS[(checksum >> 4) as usize],
        HEX_DIGITS[(checksum & 0x0F) as usize],
    ]
}

/// Validate the checksum of an NMEA sentence
///
/// The sentence may or may not carry its `\r\n` terminator.
///
/// # Returns
///
/// * `bool` - `true` if the two digits after `*` match the XOR of the payload
///
/// # Examples
///
/// ```
/// use payload_daq::nmea::checksum_validator;
///
/// assert!(checksum_validator(b"$GPGSV,3,3,10,25,11,232,17,29,02,286,,1*62\r\n"));
/// assert!(!checksum_validator(b"$GPGSV,3,3,10,25,11,232,17,29,02,287,,1*62\r\n"));
/// ```
pub fn checksum_validator(packet: &[u8]) -> bool {
    let Some(range) = payload_range(packet) else {
        return false;
    };
    let body = strip_terminator(packet);

    if body[0] != NMEA_START || body[range.end] != NMEA_CHECKSUM_DELIMITER {
        return false;
    }

    let expected = checksum_digits(compute_checksum(&packet[range.clone()]));
    body[range.end + 1..] == expected
}
