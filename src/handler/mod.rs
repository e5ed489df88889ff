//! Handler module - device frame handling and dispatch.
//!
//! Provides:
//! - [`FrameRegistry`] - maps command opcodes to handlers
//! - [`FrameContext`] - allows handlers to reply to the device
//!
//! Frames with no registered handler are broadcast to clients instead.
//!
//! # Example
//!
//! ```
//! use serial_bridge::handler::FrameRegistry;
//!
//! let mut registry = FrameRegistry::new();
//!
//! // Echo every ping back with the same payload
//! registry.register(0x01, |frame, ctx| async move {
//!     ctx.respond(0x01, frame.payload).await
//! });
//!
//! // Acknowledge status frames
//! registry.register(0x02, |_frame, ctx| async move { ctx.ack().await });
//! ```

mod context;
mod registry;

pub use context::FrameContext;
pub use registry::{BoxFuture, FrameHandler, FrameRegistry, HandlerResult};
