//! Frame assembler for the device byte stream.
//!
//! Bytes are pushed one at a time. The assembler walks a state machine:
//! - `Idle`: waiting for a start marker
//! - `Command`: start seen, need the opcode
//! - `Length`: need the two little-endian length bytes
//! - `Payload`: reading exactly `length` bytes under the escape rule
//! - `Crc` / `End`: checksum byte, then the end marker
//!
//! Each stage consumes a bounded number of bytes, so malformed input can
//! never wedge the assembler. After any error it is back in `Idle`.
//!
//! # Example
//!
//! ```
//! use serial_bridge::protocol::{build_packet, Frame, FrameAssembler, Step};
//!
//! let packet = build_packet(&Frame::new(0, 0x04, vec![0x10, 0x00]).unwrap()).unwrap();
//! let mut assembler = FrameAssembler::new();
//!
//! let mut frames = Vec::new();
//! for byte in packet.iter() {
//!     if let Step::Frame(frame) = assembler.push(*byte) {
//!         frames.push(frame);
//!     }
//! }
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].payload(), &[0x10, 0x00]);
//! ```

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::wire_format::{is_reserved, packet_crc, sequence_of, END_FRAME};
use super::Frame;

/// Frame-level protocol fault. Reported, never fatal to the reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Checksum mismatch.
    #[error("CRC mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    Crc { computed: u8, received: u8 },

    /// Stuffing violation or missing end marker.
    #[error("Payload corruption: {0}")]
    PayloadCorruption(String),

    /// Structural fault outside a frame, e.g. an end marker with no start.
    #[error("{0}")]
    Other(String),
}

impl FrameError {
    /// Short name used in broadcast reports.
    pub fn kind(&self) -> &'static str {
        match self {
            FrameError::Crc { .. } => "Crc",
            FrameError::PayloadCorruption(_) => "PayloadCorruption",
            FrameError::Other(_) => "Other",
        }
    }
}

/// Outcome of pushing one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Byte consumed, frame still in progress.
    Pending,
    /// Byte is not protocol data (no frame in progress and not a marker).
    Passthrough(u8),
    /// A validated frame. The payload is still stuffed.
    Frame(Frame),
    /// The frame in progress was discarded.
    Error(FrameError),
}

/// Parser state. Each variant carries what has been read so far.
#[derive(Debug)]
enum State {
    Idle,
    Command {
        start: u8,
    },
    Length {
        start: u8,
        command: u8,
        low: Option<u8>,
    },
    Payload {
        start: u8,
        command: u8,
        length: u16,
        payload: BytesMut,
        escape: Option<u8>,
    },
    Crc {
        start: u8,
        command: u8,
        length: u16,
        payload: Bytes,
    },
    End {
        start: u8,
        command: u8,
        length: u16,
        payload: Bytes,
        crc: u8,
    },
}

/// Byte-at-a-time frame assembler.
pub struct FrameAssembler {
    state: State,
    /// Longest stuffed payload accepted; longer headers are rejected as `Other`.
    max_length: u16,
}

impl FrameAssembler {
    /// Create an idle assembler accepting any 16-bit length.
    pub fn new() -> Self {
        Self::with_max_length(u16::MAX)
    }

    /// Create an idle assembler that rejects headers announcing more than
    /// `max_length` payload bytes.
    ///
    /// A rejected header leaves the assembler idle right after the length
    /// field.
    pub fn with_max_length(max_length: u16) -> Self {
        Self {
            state: State::Idle,
            max_length,
        }
    }

    /// Longest payload length accepted.
    pub fn max_length(&self) -> u16 {
        self.max_length
    }

    /// True when no frame is in progress.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Drop any frame in progress.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    /// Push one byte through the state machine.
    pub fn push(&mut self, byte: u8) -> Step {
        let state = std::mem::replace(&mut self.state, State::Idle);

        match state {
            State::Idle => {
                if sequence_of(byte).is_some() {
                    self.state = State::Command { start: byte };
                    Step::Pending
                } else if byte == END_FRAME {
                    Step::Error(FrameError::Other("end marker with no start".into()))
                } else {
                    Step::Passthrough(byte)
                }
            }

            State::Command { start } => {
                self.state = State::Length {
                    start,
                    command: byte,
                    low: None,
                };
                Step::Pending
            }

            State::Length {
                start,
                command,
                low: None,
            } => {
                self.state = State::Length {
                    start,
                    command,
                    low: Some(byte),
                };
                Step::Pending
            }

            State::Length {
                start,
                command,
                low: Some(low),
            } => {
                let length = u16::from_le_bytes([low, byte]);
                if length > self.max_length {
                    return Step::Error(FrameError::Other(format!(
                        "frame length {} exceeds limit {}",
                        length, self.max_length
                    )));
                }
                self.state = if length == 0 {
                    State::Crc {
                        start,
                        command,
                        length,
                        payload: Bytes::new(),
                    }
                } else {
                    State::Payload {
                        start,
                        command,
                        length,
                        payload: BytesMut::with_capacity(length as usize),
                        escape: None,
                    }
                };
                Step::Pending
            }

            State::Payload {
                start,
                command,
                length,
                mut payload,
                mut escape,
            } => {
                if is_reserved(byte) {
                    match escape {
                        Some(pending) if pending != byte => {
                            return Step::Error(FrameError::PayloadCorruption(format!(
                                "marker 0x{:02X} follows unescaped 0x{:02X}",
                                byte, pending
                            )));
                        }
                        Some(_) => escape = None,
                        None => escape = Some(byte),
                    }
                } else if let Some(pending) = escape {
                    return Step::Error(FrameError::PayloadCorruption(format!(
                        "unescaped marker 0x{:02X} in payload",
                        pending
                    )));
                }

                payload.extend_from_slice(&[byte]);

                if payload.len() < length as usize {
                    self.state = State::Payload {
                        start,
                        command,
                        length,
                        payload,
                        escape,
                    };
                    return Step::Pending;
                }

                if let Some(pending) = escape {
                    return Step::Error(FrameError::PayloadCorruption(format!(
                        "trailing unescaped marker 0x{:02X}",
                        pending
                    )));
                }

                self.state = State::Crc {
                    start,
                    command,
                    length,
                    payload: payload.freeze(),
                };
                Step::Pending
            }

            State::Crc {
                start,
                command,
                length,
                payload,
            } => {
                self.state = State::End {
                    start,
                    command,
                    length,
                    payload,
                    crc: byte,
                };
                Step::Pending
            }

            State::End {
                start,
                command,
                length,
                payload,
                crc,
            } => {
                if byte != END_FRAME {
                    return Step::Error(FrameError::PayloadCorruption(format!(
                        "expected end marker, got 0x{:02X}",
                        byte
                    )));
                }

                let mut body = Vec::with_capacity(3 + payload.len());
                body.push(command);
                body.extend_from_slice(&length.to_le_bytes());
                body.extend_from_slice(&payload);
                let computed = packet_crc(start, &body, byte);

                if computed != crc {
                    return Step::Error(FrameError::Crc {
                        computed,
                        received: crc,
                    });
                }

                Step::Frame(Frame {
                    // Always Some: only start markers leave Idle.
                    sequence: sequence_of(start).unwrap_or(0),
                    command,
                    length,
                    payload,
                })
            }
        }
    }

    /// Push a slice and collect every non-pending step.
    pub fn push_all(&mut self, data: &[u8]) -> Vec<Step> {
        data.iter()
            .map(|&b| self.push(b))
            .filter(|step| !matches!(step, Step::Pending))
            .collect()
    }

    /// Current state name for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::Idle => "Idle",
            State::Command { .. } => "Command",
            State::Length { .. } => "Length",
            State::Payload { .. } => "Payload",
            State::Crc { .. } => "Crc",
            State::End { .. } => "End",
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
