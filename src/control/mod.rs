//! Control plane - text commands driving a set of sessions.
//!
//! # Workflow
//!
//! 1. A host reads control lines (stdin, socket, ...)
//! 2. Each line is parsed into a [`ControlCommand`]
//! 3. The [`SessionHub`] opens, closes and feeds sessions by port name
//! 4. Results and device output reach clients through the broadcast sink
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serial_bridge::control::{SessionHub, StdoutSink};
//!
//! let hub = SessionHub::new(Arc::new(StdoutSink));
//! hub.handle_line("open /dev/ttyUSB0 dtrOn").await;
//! hub.handle_line("send /dev/ttyUSB0 G28").await;
//! ```

mod command;
mod hub;
mod stdio;

pub use command::ControlCommand;
pub use hub::SessionHub;
pub use stdio::{run_stdio, write_stdout_json, write_stdout_line, StdoutSink};
