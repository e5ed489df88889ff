//! Handler registry for dispatching frames by command opcode.
//!
//! # Example
//!
//! ```
//! use serial_bridge::handler::FrameRegistry;
//!
//! let mut registry = FrameRegistry::new();
//! registry.register(0x04, |frame, ctx| async move {
//!     ctx.respond(frame.command, frame.payload).await
//! });
//! assert!(registry.contains(0x04));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::FrameContext;
use crate::error::Result;
use crate::protocol::Frame;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for frame handlers.
///
/// Handlers receive the frame with its payload already unstuffed.
pub trait FrameHandler: Send + Sync + 'static {
    fn call(&self, frame: Frame, ctx: FrameContext) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> FrameHandler for F
where
    F: Fn(Frame, FrameContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, frame: Frame, ctx: FrameContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(frame, ctx))
    }
}

/// Registry mapping command opcodes to handlers.
#[derive(Default)]
pub struct FrameRegistry {
    handlers: HashMap<u8, Box<dyn FrameHandler>>,
}

impl FrameRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler function, replacing any previous one for `command`.
    pub fn register<F, Fut>(&mut self, command: u8, handler: F)
    where
        F: Fn(Frame, FrameContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.insert(command, Box::new(handler));
    }

    /// Register a handler object.
    pub fn register_handler<H: FrameHandler>(&mut self, command: u8, handler: H) {
        self.handlers.insert(command, Box::new(handler));
    }

    /// True if a handler is registered for `command`.
    pub fn contains(&self, command: u8) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a frame to its handler.
    ///
    /// Returns `None` when no handler is registered for the opcode.
    pub async fn dispatch(&self, frame: Frame, ctx: FrameContext) -> Option<HandlerResult> {
        let handler = self.handlers.get(&frame.command)?;
        Some(handler.call(frame, ctx).await)
    }
}
