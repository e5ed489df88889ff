//! Frame struct and byte-stuffing.
//!
//! A [`Frame`] carries the sequence bit, the command opcode, the payload
//! length and the payload. Frames are plain values: built per send, consumed
//! by one handler on receive.
//!
//! # Example
//!
//! ```
//! use serial_bridge::protocol::{stuff, unstuff, Frame, START_FRAME};
//!
//! let frame = Frame::new(0, 0x04, vec![0x01, START_FRAME]).unwrap();
//! let stuffed = frame.stuffed().unwrap();
//! assert_eq!(stuffed.length, 3);
//! assert_eq!(stuffed.unstuffed().unwrap().payload(), frame.payload());
//!
//! assert_eq!(unstuff(&stuff(&[START_FRAME])).unwrap(), vec![START_FRAME]);
//! ```

use bytes::Bytes;

use super::wire_format::{checked_length, is_reserved};
use super::FrameError;
use crate::error::Result;

/// One protocol packet exchanged with the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Alternating sequence bit (0 or 1).
    pub sequence: u8,
    /// Command opcode.
    pub command: u8,
    /// Payload length as carried in the length field, i.e. the stuffed
    /// length. Unstuffing keeps it, so it can exceed `payload.len()`.
    pub length: u16,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with `length` taken from the payload.
    pub fn new(sequence: u8, command: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let length = checked_length(payload.len())?;
        Ok(Self {
            sequence: sequence & 1,
            command,
            length,
            payload,
        })
    }

    /// Payload as a slice.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode to `[command][length_le][payload]`.
    ///
    /// Markers and CRC are added by [`build_packet`](super::build_packet)
    /// because the CRC spans the whole packet.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.payload.len());
        buf.push(self.command);
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Copy of this frame with its payload stuffed and length updated.
    pub fn stuffed(&self) -> Result<Frame> {
        let payload = stuff(&self.payload);
        let length = checked_length(payload.len())?;
        Ok(Frame {
            sequence: self.sequence,
            command: self.command,
            length,
            payload: Bytes::from(payload),
        })
    }

    /// Copy of this frame with escapes removed from the payload.
    ///
    /// `length` keeps the wire value.
    pub fn unstuffed(&self) -> std::result::Result<Frame, FrameError> {
        let payload = unstuff(&self.payload)?;
        Ok(Frame {
            sequence: self.sequence,
            command: self.command,
            length: self.length,
            payload: Bytes::from(payload),
        })
    }
}

/// Duplicate every reserved byte in `payload`.
pub fn stuff(payload: &[u8]) -> Vec<u8> {
    let extra = payload.iter().filter(|&&b| is_reserved(b)).count();
    let mut out = Vec::with_capacity(payload.len() + extra);
    for &byte in payload {
        out.push(byte);
        if is_reserved(byte) {
            out.push(byte);
        }
    }
    out
}

/// Collapse doubled reserved bytes.
///
/// A reserved byte that is not immediately followed by the same byte is
/// corruption, including when it is the last byte of the payload.
pub fn unstuff(payload: &[u8]) -> std::result::Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(payload.len());
    let mut bytes = payload.iter().copied().enumerate();

    while let Some((index, byte)) = bytes.next() {
        if is_reserved(byte) {
            match bytes.next() {
                Some((_, next)) if next == byte => {}
                Some(_) => {
                    return Err(FrameError::PayloadCorruption(format!(
                        "unescaped marker 0x{:02X} at offset {}",
                        byte, index
                    )))
                }
                None => {
                    return Err(FrameError::PayloadCorruption(format!(
                        "trailing unescaped marker 0x{:02X}",
                        byte
                    )))
                }
            }
        }
        out.push(byte);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::protocol::{END_FRAME, START_FRAME, START_FRAME_ALT};

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(0, 4, vec![1, 2, 3]).unwrap();
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.command, 4);
        assert_eq!(frame.length, 3);
        assert_eq!(frame.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_sequence_is_single_bit() {
        let frame = Frame::new(3, 1, Bytes::new()).unwrap();
        assert_eq!(frame.sequence, 1);
    }

    #[test]
    fn test_frame_too_large() {
        let result = Frame::new(0, 1, vec![0u8; 70_000]);
        assert!(matches!(result, Err(BridgeError::PayloadTooLarge(70_000))));
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(0, 0x02, vec![0x00, 0xBE, 0x00]).unwrap();
        assert_eq!(frame.encode(), vec![0x02, 0x03, 0x00, 0x00, 0xBE, 0x00]);
    }

    #[test]
    fn test_encode_length_little_endian() {
        let frame = Frame::new(0, 0x01, vec![0u8; 0x0102]).unwrap();
        let encoded = frame.encode();
        assert_eq!(&encoded[1..3], &[0x02, 0x01]);
    }

    #[test]
    fn test_stuff_single_start_marker() {
        let stuffed = stuff(&[START_FRAME]);
        assert_eq!(stuffed, vec![START_FRAME, START_FRAME]);
        assert_eq!(unstuff(&stuffed).unwrap(), vec![START_FRAME]);
    }

    #[test]
    fn test_stuff_grows_by_two_bytes_in_frame() {
        let frame = Frame::new(0, 1, vec![0x10, START_FRAME, 0x20]).unwrap();
        let stuffed = frame.stuffed().unwrap();
        assert_eq!(stuffed.length, frame.length + 1);
        assert_eq!(stuffed.payload(), &[0x10, START_FRAME, START_FRAME, 0x20]);
    }

    #[test]
    fn test_stuff_all_reserved() {
        let stuffed = stuff(&[START_FRAME, START_FRAME_ALT, END_FRAME]);
        assert_eq!(
            stuffed,
            vec![START_FRAME, START_FRAME, START_FRAME_ALT, START_FRAME_ALT, END_FRAME, END_FRAME]
        );
    }

    #[test]
    fn test_stuff_plain_payload_unchanged() {
        let payload = b"G0 X10\n";
        assert_eq!(stuff(payload), payload.to_vec());
    }

    #[test]
    fn test_round_trip() {
        let payloads: [&[u8]; 5] = [
            b"",
            b"hello",
            &[0x00, 0xFF, 0x7F, 0x80],
            &[START_FRAME, 0x01, END_FRAME],
            &[END_FRAME, END_FRAME, START_FRAME_ALT],
        ];
        for payload in payloads {
            assert_eq!(unstuff(&stuff(payload)).unwrap(), payload.to_vec());
        }
    }

    #[test]
    fn test_unstuff_lone_marker_mid_payload() {
        let result = unstuff(&[0x01, END_FRAME, 0x02]);
        assert!(matches!(result, Err(FrameError::PayloadCorruption(_))));
    }

    #[test]
    fn test_unstuff_mismatched_pair() {
        let result = unstuff(&[START_FRAME, END_FRAME]);
        assert!(matches!(result, Err(FrameError::PayloadCorruption(_))));
    }

    #[test]
    fn test_unstuff_trailing_marker_is_corruption() {
        let result = unstuff(&[0x01, 0x02, START_FRAME]);
        assert!(matches!(result, Err(FrameError::PayloadCorruption(_))));
    }

    #[test]
    fn test_unstuffed_frame_keeps_wire_length() {
        let frame = Frame::new(1, 2, vec![END_FRAME, END_FRAME, 0x03]).unwrap();
        let plain = frame.unstuffed().unwrap();
        assert_eq!(plain.length, 3);
        assert_eq!(plain.payload(), &[END_FRAME, 0x03]);
        assert_eq!(plain.sequence, 1);
    }
}
