//! Serial session builder and runtime.
//!
//! The [`SessionBuilder`] provides a fluent API for configuring a port and
//! its frame handlers. The [`SerialSession`] manages the lifecycle:
//! 1. Open the port (or take a ready stream)
//! 2. Spawn the flow gate actor
//! 3. Spawn the reader, buffered writer and raw writer
//! 4. Route device bytes to frame handlers or telemetry lines
//! 5. On close: gate first, then workers, then the port
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serial_bridge::{SerialSession, sink::Broadcast};
//!
//! #[tokio::main]
//! async fn main() -> serial_bridge::Result<()> {
//!     let sink = Arc::new(|msg: Broadcast| println!("{}", msg.to_json().unwrap()));
//!     let session = SerialSession::builder("/dev/ttyUSB0")
//!         .baud(115_200)
//!         .handle(0x04, |frame, ctx| async move { ctx.ack().await })
//!         .open(sink)?;
//!
//!     session.send("G28\n", "home").await?;
//!     session.close().await;
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::flow::{FlowGate, GateConfig, GateStats};
use crate::handler::{FrameContext, FrameRegistry, HandlerResult};
use crate::protocol::{Frame, FrameAssembler, FrameError, Step};
use crate::sink::{Broadcast, BroadcastSink, Report};
use crate::transport::{BoxedPort, Port, PortOpener, PortSettings, SerialOpener, DEFAULT_BAUD};
use crate::writer::{
    buffered_writer_loop, raw_writer_loop, Command, WriteJob, WriterHandle, WriterShared,
    DEFAULT_BUFFERED_CAPACITY, RAW_QUEUE_CAPACITY,
};

/// Read chunk size.
const READ_BUFFER_SIZE: usize = 4096;

/// Longest text line kept before it is forwarded unterminated.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Default limit on the payload length a frame header may announce.
pub const DEFAULT_MAX_FRAME_LENGTH: u16 = 1024;

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device path or name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud: u32,
    /// Pulse DTR after opening.
    pub dtr: bool,
    /// Capacity of the buffered command queue.
    pub buffered_capacity: usize,
    /// Frame headers announcing a longer payload are treated as text.
    pub max_frame_length: u16,
    pub gate: GateConfig,
}

impl SessionConfig {
    /// Config for `port` with defaults for everything else.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Line settings for the transport.
    pub fn settings(&self) -> PortSettings {
        PortSettings {
            baud: self.baud,
            dtr: self.dtr,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: DEFAULT_BAUD,
            dtr: false,
            buffered_capacity: DEFAULT_BUFFERED_CAPACITY,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            gate: GateConfig::default(),
        }
    }
}

/// Lifecycle state. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SessionState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionExit {
    /// `close()` was called.
    Closed,
    /// A device write failed.
    WriteFailed(String),
    /// The device stream failed or ended.
    ReadFailed(String),
}

impl SessionExit {
    /// True for exits a supervisor may want to recover from.
    pub fn is_fault(&self) -> bool {
        !matches!(self, SessionExit::Closed)
    }
}

/// Builder for configuring and opening a session.
pub struct SessionBuilder {
    config: SessionConfig,
    registry: FrameRegistry,
}

impl SessionBuilder {
    /// Create a builder for `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            config: SessionConfig::new(port),
            registry: FrameRegistry::new(),
        }
    }

    /// Start from a full config.
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            registry: FrameRegistry::new(),
        }
    }

    /// Line speed.
    ///
    /// Default: 115200
    pub fn baud(mut self, baud: u32) -> Self {
        self.config.baud = baud;
        self
    }

    /// Pulse DTR after opening.
    pub fn dtr(mut self, dtr: bool) -> Self {
        self.config.dtr = dtr;
        self
    }

    /// Capacity of the buffered command queue.
    ///
    /// Default: 500 000
    pub fn buffered_capacity(mut self, capacity: usize) -> Self {
        self.config.buffered_capacity = capacity;
        self
    }

    /// Longest frame payload accepted from the device.
    ///
    /// Default: 1024
    pub fn max_frame_length(mut self, max_length: u16) -> Self {
        self.config.max_frame_length = max_length;
        self
    }

    /// Replace the whole gate config.
    pub fn gate(mut self, gate: GateConfig) -> Self {
        self.config.gate = gate;
        self
    }

    /// Device buffer depth in commands.
    ///
    /// Default: 2
    pub fn buffer_max(mut self, buffer_max: usize) -> Self {
        self.config.gate.buffer_max = buffer_max;
        self
    }

    /// Give up on a command parked at the gate after `timeout`.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.config.gate.release_timeout = Some(timeout);
        self
    }

    /// Settle delay after each normal admission.
    ///
    /// Default: 10 ms
    pub fn admit_delay(mut self, delay: Duration) -> Self {
        self.config.gate.admit_delay = delay;
        self
    }

    /// Register a handler for frames with the given command opcode.
    pub fn handle<F, Fut>(mut self, command: u8, handler: F) -> Self
    where
        F: Fn(Frame, FrameContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register(command, handler);
        self
    }

    /// Open the serial device and start the session.
    pub fn open(self, sink: Arc<dyn BroadcastSink>) -> Result<SerialSession> {
        self.open_with(&SerialOpener, sink)
    }

    /// Open through `opener` and start the session.
    ///
    /// A failed open is broadcast as `OpenFail` and returned.
    pub fn open_with(
        self,
        opener: &dyn PortOpener,
        sink: Arc<dyn BroadcastSink>,
    ) -> Result<SerialSession> {
        let io = match opener.open(&self.config.port, &self.config.settings()) {
            Ok(io) => io,
            Err(e) => {
                error!(port = %self.config.port, "Error opening port: {}", e);
                sink.broadcast(
                    Report::OpenFail {
                        desc: format!("Error opening port. {}", e),
                        port: self.config.port.clone(),
                        baud: self.config.baud,
                    }
                    .into(),
                );
                return Err(e);
            }
        };
        SerialSession::start(self.config, self.registry, io, sink)
    }

    /// Start the session over an already open stream.
    pub fn start(self, io: impl Port, sink: Arc<dyn BroadcastSink>) -> Result<SerialSession> {
        SerialSession::start(self.config, self.registry, Box::new(io), sink)
    }
}

/// One open serial connection and its workers.
///
/// Dropping the session cancels its workers; call [`close`](Self::close)
/// to wait for them and release the port.
pub struct SerialSession {
    port: Arc<str>,
    config: SessionConfig,
    writer: WriterHandle,
    gate: FlowGate,
    sink: Arc<dyn BroadcastSink>,
    /// Stops the workers.
    cancel: CancellationToken,
    /// Stops the gate. Child of `cancel`.
    gate_cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    exit: Arc<watch::Sender<Option<SessionExit>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SerialSession {
    /// Create a session builder.
    pub fn builder(port: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(port)
    }

    fn start(
        config: SessionConfig,
        registry: FrameRegistry,
        io: BoxedPort,
        sink: Arc<dyn BroadcastSink>,
    ) -> Result<Self> {
        let port: Arc<str> = Arc::from(config.port.as_str());
        let (state, _) = watch::channel(SessionState::Opening);
        let (exit, _) = watch::channel(None);
        let exit = Arc::new(exit);

        let cancel = CancellationToken::new();
        let gate_cancel = cancel.child_token();
        let (gate, gate_task) = FlowGate::spawn(config.gate.clone(), gate_cancel.clone())?;

        let (read_half, write_half) = tokio::io::split(io);
        let (buffered_tx, buffered_rx) = mpsc::channel(config.buffered_capacity.max(1));
        let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let epoch = Arc::new(AtomicU64::new(0));
        let writer = WriterHandle::new(buffered_tx, raw_tx.clone(), in_flight.clone(), epoch.clone());
        let shared = WriterShared {
            port: config.port.clone(),
            in_flight,
            epoch,
            sink: sink.clone(),
        };

        // Raw writer: a failed write ends the session.
        let raw_task = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            let exit = exit.clone();
            tokio::spawn(async move {
                if let Err(e) = raw_writer_loop(raw_rx, write_half, shared, cancel.clone()).await {
                    set_exit(&exit, SessionExit::WriteFailed(e.to_string()));
                    cancel.cancel();
                }
            })
        };

        let buffered_task = tokio::spawn(buffered_writer_loop(
            buffered_rx,
            gate.clone(),
            raw_tx,
            shared,
            cancel.clone(),
        ));

        let reader = Reader {
            port: port.clone(),
            gate: gate.clone(),
            registry: Arc::new(registry),
            sink: sink.clone(),
            packets: writer.packets(),
            next_sequence: Arc::new(AtomicU8::new(0)),
            assembler: FrameAssembler::with_max_length(config.max_frame_length),
            held: Vec::new(),
            replay: VecDeque::new(),
            line: Vec::new(),
        };
        let reader_task = {
            let cancel = cancel.clone();
            let exit = exit.clone();
            let sink = sink.clone();
            let port = port.clone();
            tokio::spawn(async move {
                let result = reader.run(read_half, cancel.clone()).await;
                sink.broadcast(Broadcast::status(&port, "Shutting down reader"));
                if let Err(e) = result {
                    if !cancel.is_cancelled() {
                        warn!(port = %port, "Reader stopped: {}", e);
                        set_exit(&exit, SessionExit::ReadFailed(e.to_string()));
                        cancel.cancel();
                    }
                }
            })
        };

        state.send_replace(SessionState::Open);
        info!(port = %port, baud = config.baud, "Session open");
        sink.broadcast(
            Report::Open {
                desc: "Got register/open on port.".to_string(),
                port: config.port.clone(),
                baud: config.baud,
            }
            .into(),
        );

        Ok(Self {
            port,
            config,
            writer,
            gate,
            sink,
            cancel,
            gate_cancel,
            state,
            exit,
            tasks: Mutex::new(vec![gate_task, buffered_task, raw_task, reader_task]),
        })
    }

    /// Port name.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Why the session stopped, once it has.
    pub fn exit(&self) -> Option<SessionExit> {
        self.exit.borrow().clone()
    }

    /// Watch the exit status.
    pub fn exit_watch(&self) -> watch::Receiver<Option<SessionExit>> {
        self.exit.subscribe()
    }

    /// Commands queued but not yet written or discarded.
    pub fn in_flight(&self) -> usize {
        self.writer.in_flight()
    }

    /// Writer handle for queueing commands from other tasks.
    pub fn writer(&self) -> WriterHandle {
        self.writer.clone()
    }

    /// Queue a command through the flow gate.
    pub async fn send(&self, data: impl Into<String>, id: impl Into<String>) -> Result<()> {
        self.send_command(Command::buffered(data, id)).await
    }

    /// Queue a command that bypasses the flow gate.
    pub async fn send_nobuf(&self, data: impl Into<String>, id: impl Into<String>) -> Result<()> {
        self.send_command(Command::unbuffered(data, id)).await
    }

    /// Queue a fully specified command.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        if self.state() != SessionState::Open || self.cancel.is_cancelled() {
            return Err(BridgeError::SessionClosed);
        }
        debug!(port = %self.port, id = %command.id, nobuf = command.skipped_buffer, "Queueing command");
        self.writer.send(command).await
    }

    /// Discard every queued command and release parked senders.
    ///
    /// Returns how many commands the gate was holding.
    pub async fn wipe(&self) -> Result<usize> {
        self.writer.bump_epoch();
        let cleared = self.gate.wipe().await?;
        self.sink.broadcast(
            Report::WipedQueue {
                queued: cleared,
                port: self.port.to_string(),
            }
            .into(),
        );
        Ok(cleared)
    }

    /// Flow gate statistics.
    pub async fn stats(&self) -> Result<GateStats> {
        self.gate.stats().await
    }

    /// Close the session. Safe to call more than once; later calls wait
    /// for the first to finish.
    pub async fn close(&self) {
        let first = self.state.send_if_modified(|state| {
            if *state < SessionState::Closing {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });

        if !first {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
            return;
        }

        info!(port = %self.port, "Closing session");

        // Gate first so parked writers are released before the workers stop.
        self.gate_cancel.cancel();
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(port = %self.port, "Session task panicked: {}", e);
            }
        }

        set_exit(&self.exit, SessionExit::Closed);
        self.state.send_replace(SessionState::Closed);
        self.sink.broadcast(
            Report::Close {
                desc: "Got unregister/close on port.".to_string(),
                port: self.port.to_string(),
            }
            .into(),
        );
        info!(port = %self.port, "Session closed");
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Record the first exit reason only.
fn set_exit(exit: &watch::Sender<Option<SessionExit>>, reason: SessionExit) {
    exit.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

/// Reading worker state.
struct Reader {
    port: Arc<str>,
    gate: FlowGate,
    registry: Arc<FrameRegistry>,
    sink: Arc<dyn BroadcastSink>,
    packets: mpsc::Sender<WriteJob>,
    next_sequence: Arc<AtomicU8>,
    assembler: FrameAssembler,
    /// Bytes consumed by the frame in progress.
    held: Vec<u8>,
    /// Bytes handed back as text by an aborted frame, not yet routed.
    replay: VecDeque<u8>,
    /// Partial text line.
    line: Vec<u8>,
}

impl Reader {
    /// Read until cancelled. End of stream is an error.
    async fn run<R>(mut self, mut reader: R, cancel: CancellationToken) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => read?,
            };

            if n == 0 {
                return Err(BridgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "serial stream ended",
                )));
            }

            for &byte in &buf[..n] {
                self.push(byte).await;
            }
        }
    }

    async fn push(&mut self, byte: u8) {
        self.replay.push_back(byte);
        while let Some(byte) = self.replay.pop_front() {
            self.route(byte).await;
        }
    }

    /// Route one byte. Frames are only recognized at a line boundary.
    async fn route(&mut self, byte: u8) {
        if !self.line.is_empty() && self.assembler.is_idle() {
            self.text(byte).await;
            return;
        }

        self.held.push(byte);
        match self.assembler.push(byte) {
            Step::Pending => {}
            Step::Passthrough(byte) => {
                self.held.clear();
                self.text(byte).await;
            }
            Step::Frame(frame) => {
                self.held.clear();
                self.frame(frame).await;
            }
            // Not a frame after all ('U...' or '*...' lines): the bytes are text.
            Step::Error(FrameError::Other(reason)) => {
                debug!(port = %self.port, "{}", reason);
                let mut held = std::mem::take(&mut self.held).into_iter();
                if let Some(first) = held.next() {
                    self.text(first).await;
                }
                for byte in held.rev() {
                    self.replay.push_front(byte);
                }
            }
            Step::Error(e) => {
                self.held.clear();
                self.frame_error(e);
            }
        }
    }

    async fn text(&mut self, byte: u8) {
        if byte == b'\n' {
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            self.flush_line().await;
            return;
        }

        self.line.push(byte);
        if self.line.len() >= MAX_LINE_LENGTH {
            warn!(port = %self.port, "Text line too long, forwarding partial line");
            self.flush_line().await;
        }
    }

    async fn flush_line(&mut self) {
        let raw = std::mem::take(&mut self.line);
        if raw.is_empty() {
            return;
        }

        let text = String::from_utf8_lossy(&raw);
        let outcome = self.gate.ingest_line(&text).await;
        self.sink.broadcast(Broadcast::Data {
            port: self.port.to_string(),
            data: format!("{}\n", outcome.line),
        });
    }

    async fn frame(&mut self, frame: Frame) {
        let frame = match frame.unstuffed() {
            Ok(frame) => frame,
            Err(e) => return self.frame_error(e),
        };

        debug!(
            port = %self.port,
            command = frame.command,
            length = frame.length,
            "Frame received"
        );

        if !self.registry.contains(frame.command) {
            self.sink.broadcast(
                Report::Frame {
                    port: self.port.to_string(),
                    sequence: frame.sequence,
                    command: frame.command,
                    length: frame.length,
                    payload: frame.payload.to_vec(),
                }
                .into(),
            );
            return;
        }

        let command = frame.command;
        let ctx = FrameContext::with_writer(
            self.port.clone(),
            &frame,
            self.next_sequence.clone(),
            self.packets.clone(),
        );
        if let Some(Err(e)) = self.registry.dispatch(frame, ctx).await {
            error!(port = %self.port, command, "Handler error: {}", e);
        }
    }

    fn frame_error(&self, e: FrameError) {
        warn!(port = %self.port, "Frame dropped: {}", e);
        self.sink.broadcast(
            Report::FrameError {
                port: self.port.to_string(),
                kind: e.kind().to_string(),
                desc: e.to_string(),
            }
            .into(),
        );
    }
}
