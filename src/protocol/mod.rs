//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol spoken with the device:
//! - Packet layout, CRC-8 and packet building
//! - Byte-stuffing of reserved marker bytes
//! - Byte-at-a-time frame assembler

mod assembler;
mod frame;
mod wire_format;

pub use assembler::{FrameAssembler, FrameError, Step};
pub use frame::{stuff, unstuff, Frame};
pub use wire_format::{
    build_packet, is_reserved, packet_crc, sequence_of, start_marker, CRC8, CRC_8_DEVICE,
    END_FRAME, PACKET_OVERHEAD, SEQUENCE_MASK, START_FRAME, START_FRAME_ALT,
};
