//! Frame context for handlers.
//!
//! Provides methods for replying to the device:
//! - `respond` - send a packet with raw payload bytes
//! - `respond_json` - send a packet with a JSON payload
//! - `ack` - send an empty packet echoing the command
//!
//! Replies travel through the raw writer, so they are ordered with text
//! commands. The start marker alternates between sequence 0 and 1 on every
//! packet sent from this port.
//!
//! # Example
//!
//! ```ignore
//! async fn version_handler(frame: Frame, ctx: FrameContext) -> Result<()> {
//!     ctx.respond(frame.command, b"1.0".to_vec()).await
//! }
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};
use crate::protocol::{build_packet, Frame};
use crate::writer::WriteJob;

/// Context passed to frame handlers.
///
/// `FrameContext` is `Clone` and can be moved into spawned tasks.
#[derive(Clone)]
pub struct FrameContext {
    /// Port the frame arrived on.
    port: Arc<str>,
    /// Sequence bit of the received frame.
    sequence: u8,
    /// Command opcode of the received frame.
    command: u8,
    /// Next outbound sequence bit, shared per port.
    next_sequence: Arc<AtomicU8>,
    /// Raw writer queue.
    packets: Option<mpsc::Sender<WriteJob>>,
}

impl FrameContext {
    /// Create a context without a writer (replies are dropped).
    pub fn new(port: &str, sequence: u8, command: u8) -> Self {
        Self {
            port: Arc::from(port),
            sequence,
            command,
            next_sequence: Arc::new(AtomicU8::new(0)),
            packets: None,
        }
    }

    /// Create a context that replies through the raw writer.
    pub(crate) fn with_writer(
        port: Arc<str>,
        frame: &Frame,
        next_sequence: Arc<AtomicU8>,
        packets: mpsc::Sender<WriteJob>,
    ) -> Self {
        Self {
            port,
            sequence: frame.sequence,
            command: frame.command,
            next_sequence,
            packets: Some(packets),
        }
    }

    /// Port name.
    #[inline]
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Sequence bit of the frame being handled.
    #[inline]
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Command opcode of the frame being handled.
    #[inline]
    pub fn command(&self) -> u8 {
        self.command
    }

    /// Send a packet with the given opcode and payload.
    ///
    /// The payload is stuffed during packet building.
    pub async fn respond(&self, command: u8, payload: impl Into<Bytes>) -> Result<()> {
        let packets = match &self.packets {
            Some(p) => p,
            // No writer configured (testing mode)
            None => return Ok(()),
        };

        let sequence = self.next_sequence.fetch_xor(1, Ordering::AcqRel) & 1;
        let frame = Frame::new(sequence, command, payload)?;
        let packet = build_packet(&frame)?;

        packets
            .send(WriteJob::Packet(packet))
            .await
            .map_err(|_| BridgeError::SessionClosed)
    }

    /// Send a packet whose payload is `value` encoded as JSON.
    pub async fn respond_json<T: serde::Serialize>(&self, command: u8, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.respond(command, data).await
    }

    /// Send an empty packet echoing the received opcode.
    pub async fn ack(&self) -> Result<()> {
        self.respond(self.command, Bytes::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameAssembler, Step, START_FRAME, START_FRAME_ALT};

    fn frame() -> Frame {
        Frame::new(1, 0x04, vec![0x10]).unwrap()
    }

    fn context() -> (FrameContext, mpsc::Receiver<WriteJob>) {
        let (tx, rx) = mpsc::channel(8);
        let ctx = FrameContext::with_writer(
            Arc::from("ttyTEST"),
            &frame(),
            Arc::new(AtomicU8::new(0)),
            tx,
        );
        (ctx, rx)
    }

    fn packet(job: WriteJob) -> Bytes {
        match job {
            WriteJob::Packet(p) => p,
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[test]
    fn test_context_accessors() {
        let (ctx, _rx) = context();
        assert_eq!(ctx.port(), "ttyTEST");
        assert_eq!(ctx.sequence(), 1);
        assert_eq!(ctx.command(), 0x04);
    }

    #[tokio::test]
    async fn test_respond_without_writer() {
        let ctx = FrameContext::new("p", 0, 1);
        assert!(ctx.respond(1, b"test".to_vec()).await.is_ok());
        assert!(ctx.ack().await.is_ok());
    }

    #[tokio::test]
    async fn test_respond_builds_valid_packet() {
        let (ctx, mut rx) = context();
        ctx.respond(0x02, vec![0x00, START_FRAME]).await.unwrap();

        let packet = packet(rx.recv().await.unwrap());
        let mut assembler = FrameAssembler::new();
        let steps = assembler.push_all(&packet);

        match steps.as_slice() {
            [Step::Frame(frame)] => {
                assert_eq!(frame.command, 0x02);
                assert_eq!(frame.unstuffed().unwrap().payload(), &[0x00, START_FRAME]);
            }
            other => panic!("unexpected steps {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sequence_alternates() {
        let (ctx, mut rx) = context();
        let clone = ctx.clone();

        ctx.ack().await.unwrap();
        clone.ack().await.unwrap();
        ctx.ack().await.unwrap();

        assert_eq!(packet(rx.recv().await.unwrap())[0], START_FRAME);
        assert_eq!(packet(rx.recv().await.unwrap())[0], START_FRAME_ALT);
        assert_eq!(packet(rx.recv().await.unwrap())[0], START_FRAME);
    }

    #[tokio::test]
    async fn test_respond_json() {
        let (ctx, mut rx) = context();
        ctx.respond_json(0x09, &serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let packet = packet(rx.recv().await.unwrap());
        assert_eq!(&packet[4..packet.len() - 2], br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_respond_after_close() {
        let (ctx, rx) = context();
        drop(rx);
        let result = ctx.ack().await;
        assert!(matches!(result, Err(BridgeError::SessionClosed)));
    }
}
