//! # serial-bridge
//!
//! Serial transport engine for devices that mix text telemetry with a
//! framed binary protocol on one link.
//!
//! ## Architecture
//!
//! - **Reader**: bytes → frames (CRC-8 checked, byte-stuffed) or text lines
//! - **Flow gate**: throttles commands to the device's small input buffer
//! - **Writers**: gated buffered queue feeding one ordered raw writer
//! - **Sink**: every report, line and frame goes out as a [`Broadcast`]
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serial_bridge::{Broadcast, SerialSession};
//!
//! #[tokio::main]
//! async fn main() {
//!     let sink = Arc::new(|msg: Broadcast| eprintln!("{:?}", msg));
//!     let session = SerialSession::builder("/dev/ttyUSB0")
//!         .handle(0x04, |frame, ctx| async move {
//!             ctx.respond(frame.command, frame.payload).await
//!         })
//!         .open(sink)
//!         .unwrap();
//!
//!     session.send("G28\n", "home").await.unwrap();
//!     session.close().await;
//! }
//! ```

pub mod control;
pub mod error;
pub mod flow;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod transport;
pub mod writer;

pub use error::{BridgeError, Result};
pub use flow::{FlowGate, GateConfig};
pub use handler::FrameContext;
pub use protocol::{Frame, FrameAssembler, FrameError};
pub use session::{SerialSession, SessionBuilder, SessionConfig, SessionExit, SessionState};
pub use sink::{Broadcast, BroadcastSink, Report};
pub use writer::{Command, WriterHandle};
