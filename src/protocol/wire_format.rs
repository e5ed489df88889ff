//! Wire format constants, CRC-8 and packet building.
//!
//! Every packet on the serial link has this layout:
//! ```text
//! ┌───────┬─────────┬──────────┬──────────────────┬───────┬───────┐
//! │ Start │ Command │ Length   │ Payload (stuffed)│ CRC-8 │ End   │
//! │ 1 byte│ 1 byte  │ u16 LE   │ Length bytes     │ 1 byte│ 1 byte│
//! └───────┴─────────┴──────────┴──────────────────┴───────┴───────┘
//! ```
//!
//! The start byte is `0xAA` for sequence 0 and `0xAA ^ 0x80` for sequence 1.
//! The CRC covers start, command, length, payload and the end byte, but not
//! the CRC byte itself.

use bytes::Bytes;
use crc::{Algorithm, Crc};

use super::Frame;
use crate::error::{BridgeError, Result};

/// Start-of-frame marker (sequence 0).
pub const START_FRAME: u8 = 0xAA;

/// End-of-frame marker.
pub const END_FRAME: u8 = 0x55;

/// XOR mask applied to the start marker to signal sequence 1.
pub const SEQUENCE_MASK: u8 = 0x80;

/// Start-of-frame marker with the sequence bit set.
pub const START_FRAME_ALT: u8 = START_FRAME ^ SEQUENCE_MASK;

/// Bytes a packet adds around the payload: start, command, length (2), CRC, end.
pub const PACKET_OVERHEAD: usize = 6;

/// CRC-8 used by the device firmware.
///
/// Polynomial 0x07, init 0xFF, no reflection, no final XOR.
pub const CRC_8_DEVICE: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x07,
    init: 0xff,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xfb,
    residue: 0x00,
};

/// Shared CRC-8 engine for [`CRC_8_DEVICE`].
pub const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_DEVICE);

/// True for the three byte values that must be stuffed inside a payload.
#[inline]
pub fn is_reserved(byte: u8) -> bool {
    matches!(byte, START_FRAME | START_FRAME_ALT | END_FRAME)
}

/// Start marker to use for the given sequence (0 or 1).
#[inline]
pub fn start_marker(sequence: u8) -> u8 {
    if sequence & 1 == 0 {
        START_FRAME
    } else {
        START_FRAME_ALT
    }
}

/// Sequence encoded by a start marker, or `None` if the byte is not a start marker.
#[inline]
pub fn sequence_of(marker: u8) -> Option<u8> {
    match marker {
        START_FRAME => Some(0),
        START_FRAME_ALT => Some(1),
        _ => None,
    }
}

/// Compute the packet CRC over already-encoded packet parts.
///
/// `body` is `[command][length_le][payload]` exactly as it travels on the wire.
pub fn packet_crc(start: u8, body: &[u8], end: u8) -> u8 {
    let mut digest = CRC8.digest();
    digest.update(&[start]);
    digest.update(body);
    digest.update(&[end]);
    digest.finalize()
}

/// Build a complete packet for a frame.
///
/// The frame payload is stuffed here, so pass the plain payload.
///
/// # Example
///
/// ```
/// use serial_bridge::protocol::{build_packet, Frame, END_FRAME, START_FRAME};
///
/// let frame = Frame::new(0, 0x04, vec![0x10, 0x00]).unwrap();
/// let packet = build_packet(&frame).unwrap();
/// assert_eq!(packet[0], START_FRAME);
/// assert_eq!(packet[packet.len() - 1], END_FRAME);
/// ```
pub fn build_packet(frame: &Frame) -> Result<Bytes> {
    let stuffed = frame.stuffed()?;
    let body = stuffed.encode();
    let start = start_marker(stuffed.sequence);

    let mut packet = Vec::with_capacity(body.len() + 3);
    packet.push(start);
    packet.extend_from_slice(&body);
    packet.push(packet_crc(start, &body, END_FRAME));
    packet.push(END_FRAME);
    Ok(Bytes::from(packet))
}

/// Check a payload length against the 16-bit length field.
pub(crate) fn checked_length(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| BridgeError::PayloadTooLarge(len))
}
