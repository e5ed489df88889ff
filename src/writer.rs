//! Writer tasks between the command queues and the device.
//!
//! # Architecture
//!
//! ```text
//! send ─────► mpsc<Command> (500 000) ─► Buffered writer ──gate.accept──┐
//!                                                                        ▼
//! sendnobuf ───────────────────────────────────────────► mpsc<WriteJob> (1) ─► Raw writer ─► Port
//! frame replies ───────────────────────────────────────────────┘
//! ```
//!
//! The raw writer is the only task that touches the write half of the port,
//! so commands and protocol replies reach the device in one order.
//!
//! Every queued command bumps the in-flight counter; the raw writer (or the
//! buffered writer, for a discarded command) brings it back down.
//!
//! Buffered commands carry the wipe epoch they were queued in. A wipe bumps
//! the epoch, so commands still sitting in the queue are discarded when the
//! buffered writer reaches them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{BridgeError, Result};
use crate::flow::FlowGate;
use crate::sink::{Broadcast, BroadcastSink, BufMode, Report};

/// Default capacity of the buffered command queue.
pub const DEFAULT_BUFFERED_CAPACITY: usize = 500_000;

/// Capacity of the raw write queue. One slot keeps the gate in charge of
/// pacing.
pub const RAW_QUEUE_CAPACITY: usize = 1;

/// A text command bound for the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Text written to the device.
    pub data: String,
    /// Caller-chosen identifier echoed in reports.
    pub id: String,
    /// Sent straight to the raw writer, bypassing the gate.
    pub skipped_buffer: bool,
    /// Completion is reported by someone else; no `CompleteFake`.
    pub will_handle_complete_response: bool,
    /// Sleep after the physical write.
    pub post_write_pause: Duration,
}

impl Command {
    /// Command that goes through the flow gate.
    pub fn buffered(data: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            id: id.into(),
            skipped_buffer: false,
            will_handle_complete_response: false,
            post_write_pause: Duration::ZERO,
        }
    }

    /// Command written directly, ahead of anything parked at the gate.
    pub fn unbuffered(data: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            skipped_buffer: true,
            ..Self::buffered(data, id)
        }
    }

    /// Set the post-write pause.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.post_write_pause = pause;
        self
    }

    /// Mark completion as handled by the caller.
    pub fn handles_completion(mut self) -> Self {
        self.will_handle_complete_response = true;
        self
    }
}

/// Work item for the raw writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteJob {
    /// A text command (counted in flight).
    Command(Command),
    /// A pre-built protocol packet.
    Packet(Bytes),
}

/// Handle for queueing work to a session's writers.
///
/// This is cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    buffered: mpsc::Sender<(u64, Command)>,
    raw: mpsc::Sender<WriteJob>,
    in_flight: Arc<AtomicUsize>,
    epoch: Arc<AtomicU64>,
}

impl WriterHandle {
    pub(crate) fn new(
        buffered: mpsc::Sender<(u64, Command)>,
        raw: mpsc::Sender<WriteJob>,
        in_flight: Arc<AtomicUsize>,
        epoch: Arc<AtomicU64>,
    ) -> Self {
        Self {
            buffered,
            raw,
            in_flight,
            epoch,
        }
    }

    /// Queue a command on the buffered or raw path.
    pub async fn send(&self, command: Command) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let sent = if command.skipped_buffer {
            self.raw
                .send(WriteJob::Command(command))
                .await
                .map_err(|_| ())
        } else {
            let epoch = self.epoch.load(Ordering::Acquire);
            self.buffered.send((epoch, command)).await.map_err(|_| ())
        };

        sent.map_err(|_| {
            release(&self.in_flight);
            BridgeError::SessionClosed
        })
    }

    /// Queue a protocol packet on the raw path.
    pub async fn send_packet(&self, packet: Bytes) -> Result<()> {
        self.raw
            .send(WriteJob::Packet(packet))
            .await
            .map_err(|_| BridgeError::SessionClosed)
    }

    /// Commands queued but not yet written or discarded.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Invalidate every buffered command queued so far.
    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Raw job sender, for frame reply contexts.
    pub(crate) fn packets(&self) -> mpsc::Sender<WriteJob> {
        self.raw.clone()
    }
}

/// Decrement the in-flight counter without wrapping, returning the new value.
pub(crate) fn release(in_flight: &AtomicUsize) -> usize {
    let previous = in_flight
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
        .unwrap_or(0);
    previous.saturating_sub(1)
}

/// State shared by both writer loops.
#[derive(Clone)]
pub(crate) struct WriterShared {
    pub port: String,
    pub in_flight: Arc<AtomicUsize>,
    pub epoch: Arc<AtomicU64>,
    pub sink: Arc<dyn BroadcastSink>,
}

/// Buffered writer: admit each command through the gate, then hand it to the
/// raw writer.
pub(crate) async fn buffered_writer_loop(
    mut rx: mpsc::Receiver<(u64, Command)>,
    gate: FlowGate,
    raw: mpsc::Sender<WriteJob>,
    shared: WriterShared,
    cancel: CancellationToken,
) {
    loop {
        let (epoch, mut command) = tokio::select! {
            _ = cancel.cancelled() => break,
            queued = rx.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };

        if epoch < shared.epoch.load(Ordering::Acquire) {
            debug!(port = %shared.port, id = %command.id, "Command wiped before admission");
            release(&shared.in_flight);
            continue;
        }

        let admission = match gate.accept(&command.data, &command.id).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(port = %shared.port, id = %command.id, "Dropping command: {}", e);
                release(&shared.in_flight);
                continue;
            }
        };

        if !admission.proceed {
            debug!(port = %shared.port, id = %command.id, "Command discarded by gate");
            release(&shared.in_flight);
            continue;
        }

        if let Some(rewritten) = admission.rewritten {
            command.data = rewritten;
        }
        command.will_handle_complete_response |= admission.caller_handles_completion;

        let forwarded = tokio::select! {
            _ = cancel.cancelled() => false,
            sent = raw.send(WriteJob::Command(command)) => sent.is_ok(),
        };
        if !forwarded {
            release(&shared.in_flight);
            break;
        }
    }

    debug!(port = %shared.port, "Buffered writer stopped");
    shared
        .sink
        .broadcast(Broadcast::status(&shared.port, "Buffered writer closed"));
}

/// Raw writer: the only task that writes to the device.
///
/// Returns [`BridgeError::WriteFailure`] when the device write fails, which
/// ends the session.
pub(crate) async fn raw_writer_loop<W>(
    mut rx: mpsc::Receiver<WriteJob>,
    mut writer: W,
    shared: WriterShared,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            job = rx.recv() => match job {
                Some(job) => job,
                None => break Ok(()),
            },
        };

        let command = match job {
            WriteJob::Packet(packet) => {
                let written = tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    written = write_flush(&mut writer, &packet) => written,
                };
                if let Err(e) = written {
                    break Err(fail(&shared, e));
                }
                continue;
            }
            WriteJob::Command(command) => command,
        };

        let queued = release(&shared.in_flight);
        shared.sink.broadcast(
            Report::Write {
                queued,
                id: command.id.clone(),
                data: command.data.clone(),
                buf: if command.skipped_buffer {
                    BufMode::NoBuf
                } else {
                    BufMode::Buf
                },
                port: shared.port.clone(),
            }
            .into(),
        );

        let written = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            written = write_flush(&mut writer, command.data.as_bytes()) => written,
        };
        if let Err(e) = written {
            break Err(fail(&shared, e));
        }

        if !command.post_write_pause.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(command.post_write_pause) => {}
            }
        }

        if !command.will_handle_complete_response {
            shared.sink.broadcast(
                Report::CompleteFake {
                    id: command.id,
                    port: shared.port.clone(),
                    data: command.data,
                }
                .into(),
            );
        }
    };

    debug!(port = %shared.port, "Raw writer stopped");
    shared
        .sink
        .broadcast(Broadcast::status(&shared.port, "Shutting down writer"));
    result
}

async fn write_flush<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}

fn fail(shared: &WriterShared, source: std::io::Error) -> BridgeError {
    let err = BridgeError::WriteFailure {
        port: shared.port.clone(),
        source,
    };
    error!("{}", err);
    shared.sink.broadcast(Broadcast::error(format!("{}. Closing port.", err)));
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::GateConfig;
    use tokio::io::{duplex, AsyncReadExt};

    struct Harness {
        shared: WriterShared,
        reports: mpsc::UnboundedReceiver<Broadcast>,
    }

    fn harness() -> Harness {
        let (tx, reports) = mpsc::unbounded_channel();
        Harness {
            shared: WriterShared {
                port: "ttyTEST".to_string(),
                in_flight: Arc::new(AtomicUsize::new(0)),
                epoch: Arc::new(AtomicU64::new(0)),
                sink: Arc::new(tx),
            },
            reports,
        }
    }

    fn no_delay() -> GateConfig {
        GateConfig {
            admit_delay: Duration::ZERO,
            ..GateConfig::default()
        }
    }

    #[test]
    fn test_command_constructors() {
        let cmd = Command::buffered("G0\n", "a");
        assert!(!cmd.skipped_buffer);
        assert_eq!(cmd.post_write_pause, Duration::ZERO);

        let cmd = Command::unbuffered("!", "b")
            .with_pause(Duration::from_millis(5))
            .handles_completion();
        assert!(cmd.skipped_buffer);
        assert!(cmd.will_handle_complete_response);
        assert_eq!(cmd.post_write_pause, Duration::from_millis(5));
    }

    #[test]
    fn test_release_saturates() {
        let counter = AtomicUsize::new(1);
        assert_eq!(release(&counter), 0);
        assert_eq!(release(&counter), 0);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_handle_counts_in_flight() {
        let (btx, _brx) = mpsc::channel(4);
        let (rtx, _rrx) = mpsc::channel(4);
        let handle = WriterHandle::new(btx, rtx, Arc::new(AtomicUsize::new(0)), Arc::default());

        handle.send(Command::buffered("a", "1")).await.unwrap();
        handle.send(Command::unbuffered("b", "2")).await.unwrap();
        assert_eq!(handle.in_flight(), 2);

        // Packets are not commands.
        handle.send_packet(Bytes::from_static(b"\xAA")).await.unwrap();
        assert_eq!(handle.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_handle_closed_queue() {
        let (btx, brx) = mpsc::channel(4);
        let (rtx, _rrx) = mpsc::channel(4);
        drop(brx);
        let handle = WriterHandle::new(btx, rtx, Arc::new(AtomicUsize::new(0)), Arc::default());

        let result = handle.send(Command::buffered("a", "1")).await;
        assert!(matches!(result, Err(BridgeError::SessionClosed)));
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_raw_writer_write_then_complete() {
        let mut h = harness();
        h.shared.in_flight.store(1, Ordering::Release);
        let (tx, rx) = mpsc::channel(1);
        let (port, mut device) = duplex(1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(raw_writer_loop(rx, port, h.shared.clone(), cancel.clone()));

        tx.send(WriteJob::Command(Command::buffered("G0 X10\n", "c1")))
            .await
            .unwrap();

        let mut buf = [0u8; 7];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"G0 X10\n");

        assert_eq!(
            h.reports.recv().await.unwrap(),
            Broadcast::Report(Report::Write {
                queued: 0,
                id: "c1".into(),
                data: "G0 X10\n".into(),
                buf: BufMode::Buf,
                port: "ttyTEST".into(),
            })
        );
        assert_eq!(
            h.reports.recv().await.unwrap(),
            Broadcast::Report(Report::CompleteFake {
                id: "c1".into(),
                port: "ttyTEST".into(),
                data: "G0 X10\n".into(),
            })
        );

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_raw_writer_skips_complete_when_handled() {
        let mut h = harness();
        let (tx, rx) = mpsc::channel(1);
        let (port, mut device) = duplex(1024);
        let cancel = CancellationToken::new();
        tokio::spawn(raw_writer_loop(rx, port, h.shared.clone(), cancel.clone()));

        tx.send(WriteJob::Command(
            Command::unbuffered("!", "x").handles_completion(),
        ))
        .await
        .unwrap();
        tx.send(WriteJob::Command(Command::unbuffered("?", "y")))
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"!?");

        let first = h.reports.recv().await.unwrap();
        assert!(matches!(first, Broadcast::Report(Report::Write { buf: BufMode::NoBuf, .. })));
        // Next report belongs to the second command.
        let second = h.reports.recv().await.unwrap();
        assert!(matches!(second, Broadcast::Report(Report::Write { ref id, .. }) if id == "y"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_raw_writer_packet() {
        let h = harness();
        let (tx, rx) = mpsc::channel(1);
        let (port, mut device) = duplex(1024);
        let cancel = CancellationToken::new();
        tokio::spawn(raw_writer_loop(rx, port, h.shared.clone(), cancel.clone()));

        let packet = Bytes::from_static(&[0xAA, 0x04, 0x02, 0x00, 0x10, 0x00, 0x52, 0x55]);
        tx.send(WriteJob::Packet(packet.clone())).await.unwrap();

        let mut buf = [0u8; 8];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &packet[..]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_raw_writer_post_write_pause_holds_next_command() {
        let h = harness();
        let (tx, rx) = mpsc::channel(1);
        let (port, mut device) = duplex(1024);
        let cancel = CancellationToken::new();
        tokio::spawn(raw_writer_loop(rx, port, h.shared.clone(), cancel.clone()));

        let started = tokio::time::Instant::now();
        tx.send(WriteJob::Command(
            Command::unbuffered("A", "a").with_pause(Duration::from_millis(300)),
        ))
        .await
        .unwrap();
        tx.send(WriteJob::Command(Command::unbuffered("B", "b")))
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"A");

        // Still pausing.
        let early = tokio::time::timeout(Duration::from_millis(100), device.read_exact(&mut buf)).await;
        assert!(early.is_err());

        tokio::time::timeout(Duration::from_secs(2), device.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"B");
        assert!(started.elapsed() >= Duration::from_millis(300));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_raw_writer_cancel_interrupts_pause() {
        let mut h = harness();
        let (tx, rx) = mpsc::channel(1);
        let (port, mut device) = duplex(1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(raw_writer_loop(rx, port, h.shared.clone(), cancel.clone()));

        tx.send(WriteJob::Command(
            Command::unbuffered("X\n", "a").with_pause(Duration::from_secs(30)),
        ))
        .await
        .unwrap();

        let mut buf = [0u8; 2];
        device.read_exact(&mut buf).await.unwrap();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("pause must not hold up shutdown")
            .unwrap();
        assert!(result.is_ok());

        // Interrupted before completion was reported.
        while let Ok(msg) = h.reports.try_recv() {
            assert!(!matches!(msg, Broadcast::Report(Report::CompleteFake { .. })));
        }
    }

    #[tokio::test]
    async fn test_raw_writer_failure_is_fatal() {
        let mut h = harness();
        let (tx, rx) = mpsc::channel(1);
        let (port, device) = duplex(1024);
        drop(device);
        let task = tokio::spawn(raw_writer_loop(rx, port, h.shared.clone(), CancellationToken::new()));

        tx.send(WriteJob::Command(Command::buffered("G0\n", "c1")))
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(BridgeError::WriteFailure { .. })));

        let mut saw_error = false;
        let mut saw_complete = false;
        while let Ok(msg) = h.reports.try_recv() {
            match msg {
                Broadcast::Error { .. } => saw_error = true,
                Broadcast::Report(Report::CompleteFake { .. }) => saw_complete = true,
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(!saw_complete);
    }

    #[tokio::test]
    async fn test_buffered_writer_applies_rewrite() {
        let h = harness();
        let cancel = CancellationToken::new();
        let (gate, _gate_task) = FlowGate::spawn(no_delay(), cancel.child_token()).unwrap();
        let (btx, brx) = mpsc::channel(8);
        let (rtx, mut rrx) = mpsc::channel(1);
        tokio::spawn(buffered_writer_loop(brx, gate, rtx, h.shared.clone(), cancel.clone()));

        btx.send((0, Command::buffered("M105", "t"))).await.unwrap();

        match rrx.recv().await.unwrap() {
            WriteJob::Command(cmd) => {
                assert_eq!(cmd.data, "M105\n");
                assert!(!cmd.will_handle_complete_response);
            }
            other => panic!("unexpected job {:?}", other),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_buffered_writer_discard_releases_in_flight() {
        let h = harness();
        let cancel = CancellationToken::new();
        let config = GateConfig {
            buffer_max: 1,
            ..no_delay()
        };
        let (gate, _gate_task) = FlowGate::spawn(config, cancel.child_token()).unwrap();
        let (btx, brx) = mpsc::channel(8);
        let (rtx, mut rrx) = mpsc::channel(1);
        tokio::spawn(buffered_writer_loop(
            brx,
            gate.clone(),
            rtx,
            h.shared.clone(),
            cancel.clone(),
        ));

        h.shared.in_flight.store(2, Ordering::Release);
        btx.send((0, Command::buffered("a\n", "a"))).await.unwrap();
        btx.send((0, Command::buffered("b\n", "b"))).await.unwrap();

        // First passes, second parks at the gate.
        assert!(matches!(rrx.recv().await, Some(WriteJob::Command(_))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.stats().await.unwrap().waiting, 1);

        gate.wipe().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.shared.in_flight.load(Ordering::Acquire), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_buffered_writer_drops_stale_epoch() {
        let h = harness();
        let cancel = CancellationToken::new();
        let (gate, _gate_task) = FlowGate::spawn(no_delay(), cancel.child_token()).unwrap();
        let (btx, brx) = mpsc::channel(8);
        let (rtx, mut rrx) = mpsc::channel(1);

        h.shared.in_flight.store(2, Ordering::Release);
        h.shared.epoch.store(1, Ordering::Release);
        btx.send((0, Command::buffered("old\n", "old"))).await.unwrap();
        btx.send((1, Command::buffered("new\n", "new"))).await.unwrap();
        tokio::spawn(buffered_writer_loop(brx, gate, rtx, h.shared.clone(), cancel.clone()));

        match rrx.recv().await.unwrap() {
            WriteJob::Command(cmd) => assert_eq!(cmd.id, "new"),
            other => panic!("unexpected job {:?}", other),
        }
        assert_eq!(h.shared.in_flight.load(Ordering::Acquire), 1);
        cancel.cancel();
    }
}
