//! Flow-control gate.
//!
//! The device firmware can only hold a couple of commands in its input
//! buffer. The gate tracks commands sent but not yet acknowledged and holds
//! back further senders until the device prints an advance marker.
//!
//! # Architecture
//!
//! ```text
//! buffered writer ──accept──┐
//!                           ├─► mpsc::Sender<Request> ─► Gate actor (owns pending queue,
//! reader ──────────line─────┘                             pause flag, telemetry repairer)
//! ```
//!
//! All mutable gate state lives in one task. Callers talk to it through
//! [`FlowGate`], a cheap cloneable handle. A parked caller holds a
//! `oneshot` receiver that the actor resolves with a [`Release`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::telemetry::{TelemetryConfig, TelemetryRepairer};
use crate::error::{BridgeError, Result};

/// Default device buffer depth in commands.
pub const DEFAULT_BUFFER_MAX: usize = 2;

/// Default settle delay after a normal admission.
pub const DEFAULT_ADMIT_DELAY: Duration = Duration::from_millis(10);

/// Line prefixes the device prints when it is ready for the next command.
pub const DEFAULT_ADVANCE_MARKERS: [&str; 3] = [">", "stdin:", "="];

/// Mailbox depth of the gate actor.
const MAILBOX_CAPACITY: usize = 64;

/// Flow gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Pending commands at which the gate pauses.
    pub buffer_max: usize,
    /// Line prefixes that acknowledge one pending command.
    pub advance_markers: Vec<String>,
    /// Give up on a parked caller after this long.
    pub release_timeout: Option<Duration>,
    /// Pause after a normal admission before the command proceeds.
    pub admit_delay: Duration,
    /// Append a newline to admitted commands that lack one.
    pub terminate_lines: bool,
    /// Completion is reported by the device, not synthesized.
    pub handles_completion: bool,
    /// Telemetry repair settings.
    pub telemetry: TelemetryConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            buffer_max: DEFAULT_BUFFER_MAX,
            advance_markers: DEFAULT_ADVANCE_MARKERS.iter().map(|m| m.to_string()).collect(),
            release_timeout: None,
            admit_delay: DEFAULT_ADMIT_DELAY,
            terminate_lines: true,
            handles_completion: false,
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// How a parked caller was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The device has room; proceed.
    Normal,
    /// The queue was wiped or the gate closed; discard the command.
    Wipe,
}

/// Result of [`FlowGate::accept`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Forward the command to the device.
    pub proceed: bool,
    /// The device reports completion itself.
    pub caller_handles_completion: bool,
    /// Replacement command text, if the gate rewrote it.
    pub rewritten: Option<String>,
}

impl Admission {
    fn discard() -> Self {
        Self {
            proceed: false,
            caller_handles_completion: false,
            rewritten: None,
        }
    }
}

/// Result of feeding one device text line through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineOutcome {
    /// Line to forward (possibly repaired).
    pub line: String,
    /// The line was replaced by the telemetry repairer.
    pub repaired: bool,
    /// The line acknowledged a pending command.
    pub advanced: bool,
}

/// Snapshot of gate state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub pending: usize,
    pub paused: bool,
    pub waiting: usize,
    pub repairs: u64,
    pub wipes: u64,
}

/// Messages handled by the gate actor.
enum Request {
    Accept {
        command: String,
        id: String,
        reply: oneshot::Sender<Release>,
    },
    Withdraw {
        id: String,
    },
    Ready,
    Wipe {
        reply: oneshot::Sender<usize>,
    },
    Line {
        line: String,
        reply: oneshot::Sender<LineOutcome>,
    },
    Stats {
        reply: oneshot::Sender<GateStats>,
    },
}

/// Handle to the gate actor.
///
/// Cloning is cheap; all clones talk to the same actor.
#[derive(Clone)]
pub struct FlowGate {
    tx: mpsc::Sender<Request>,
    config: Arc<GateConfig>,
}

impl FlowGate {
    /// Spawn a gate actor that runs until `cancel` fires or every handle drops.
    pub fn spawn(config: GateConfig, cancel: CancellationToken) -> Result<(Self, JoinHandle<()>)> {
        let state = GateState::new(&config)?;
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let task = tokio::spawn(gate_loop(state, rx, cancel));

        Ok((
            Self {
                tx,
                config: Arc::new(config),
            },
            task,
        ))
    }

    /// Gate configuration.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// True once the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a command and wait until the device has room for it.
    ///
    /// Returns `proceed = false` when the queue is wiped or the gate closes
    /// while waiting. Errors only with [`BridgeError::GateTimeout`].
    pub async fn accept(&self, command: &str, id: &str) -> Result<Admission> {
        let (reply, rx) = oneshot::channel();
        let request = Request::Accept {
            command: command.to_string(),
            id: id.to_string(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            return Ok(Admission::discard());
        }

        let release = match self.config.release_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(release) => release,
                Err(_) => {
                    let _ = self.tx.send(Request::Withdraw { id: id.to_string() }).await;
                    return Err(BridgeError::GateTimeout(limit));
                }
            },
            None => rx.await,
        };

        // A dropped reply means the actor is gone.
        match release.unwrap_or(Release::Wipe) {
            Release::Wipe => Ok(Admission::discard()),
            Release::Normal => {
                if !self.config.admit_delay.is_zero() {
                    tokio::time::sleep(self.config.admit_delay).await;
                }
                Ok(Admission {
                    proceed: true,
                    caller_handles_completion: self.config.handles_completion,
                    rewritten: self.rewrite(command),
                })
            }
        }
    }

    /// Device signalled room for one more command.
    pub async fn on_ready_signal(&self) {
        let _ = self.tx.send(Request::Ready).await;
    }

    /// Drop every pending command and release parked callers with `Wipe`.
    ///
    /// Returns how many pending commands were discarded.
    pub async fn wipe(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Wipe { reply })
            .await
            .map_err(|_| BridgeError::SessionClosed)?;
        rx.await.map_err(|_| BridgeError::SessionClosed)
    }

    /// Feed one device text line (without its newline).
    ///
    /// Advance markers acknowledge a pending command; other lines go through
    /// telemetry repair. A closed gate passes the line through unchanged.
    pub async fn ingest_line(&self, line: &str) -> LineOutcome {
        let passthrough = || LineOutcome {
            line: line.to_string(),
            repaired: false,
            advanced: false,
        };

        let (reply, rx) = oneshot::channel();
        let request = Request::Line {
            line: line.to_string(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            return passthrough();
        }
        rx.await.unwrap_or_else(|_| passthrough())
    }

    /// Current gate state.
    pub async fn stats(&self) -> Result<GateStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Stats { reply })
            .await
            .map_err(|_| BridgeError::SessionClosed)?;
        rx.await.map_err(|_| BridgeError::SessionClosed)
    }

    /// Command text to send instead of `command`, if any.
    fn rewrite(&self, command: &str) -> Option<String> {
        if self.config.terminate_lines && !command.ends_with('\n') {
            Some(format!("{}\n", command))
        } else {
            None
        }
    }
}

/// State owned by the actor task.
struct GateState {
    buffer_max: usize,
    advance_markers: Vec<String>,
    pending: VecDeque<(String, String)>,
    waiters: VecDeque<(String, oneshot::Sender<Release>)>,
    paused: bool,
    wipes: u64,
    telemetry: TelemetryRepairer,
}

impl GateState {
    fn new(config: &GateConfig) -> Result<Self> {
        Ok(Self {
            buffer_max: config.buffer_max.max(1),
            advance_markers: config.advance_markers.clone(),
            pending: VecDeque::new(),
            waiters: VecDeque::new(),
            paused: false,
            wipes: 0,
            telemetry: TelemetryRepairer::new(&config.telemetry)?,
        })
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Accept { command, id, reply } => self.accept(command, id, reply),
            Request::Withdraw { id } => self.withdraw(&id),
            Request::Ready => self.ready(),
            Request::Wipe { reply } => {
                let _ = reply.send(self.wipe());
            }
            Request::Line { line, reply } => {
                let _ = reply.send(self.line(line));
            }
            Request::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn accept(&mut self, command: String, id: String, reply: oneshot::Sender<Release>) {
        self.pending.push_back((command, id.clone()));

        if self.paused {
            debug!(id = %id, pending = self.pending.len(), "Gate paused, parking caller");
            self.waiters.push_back((id, reply));
            return;
        }

        let _ = reply.send(Release::Normal);
        self.pause_if_full();
    }

    fn withdraw(&mut self, id: &str) {
        self.waiters.retain(|(waiter, _)| waiter != id);
        if let Some(index) = self.pending.iter().rposition(|(_, pending)| pending == id) {
            self.pending.remove(index);
        }
        warn!(id = %id, "Caller gave up waiting for the device");
    }

    fn ready(&mut self) {
        if let Some((command, id)) = self.pending.pop_front() {
            debug!(id = %id, command = %command.trim_end(), "Device acknowledged command");
        }
        self.paused = false;

        // Skip callers that already went away.
        while let Some((id, waiter)) = self.waiters.pop_front() {
            if waiter.send(Release::Normal).is_ok() {
                debug!(id = %id, "Released parked caller");
                self.pause_if_full();
                break;
            }
        }
    }

    fn wipe(&mut self) -> usize {
        let cleared = self.pending.len();
        self.pending.clear();
        self.paused = false;
        self.release_all(Release::Wipe);
        self.wipes += 1;
        info!(cleared, "Gate wiped");
        cleared
    }

    fn line(&mut self, line: String) -> LineOutcome {
        if self.advance_markers.iter().any(|m| line.starts_with(m.as_str())) {
            self.ready();
            return LineOutcome {
                line,
                repaired: false,
                advanced: true,
            };
        }

        match self.telemetry.ingest(&line) {
            Some(repaired) => LineOutcome {
                line: repaired,
                repaired: true,
                advanced: false,
            },
            None => LineOutcome {
                line,
                repaired: false,
                advanced: false,
            },
        }
    }

    fn stats(&self) -> GateStats {
        GateStats {
            pending: self.pending.len(),
            paused: self.paused,
            waiting: self.waiters.len(),
            repairs: self.telemetry.repairs(),
            wipes: self.wipes,
        }
    }

    fn pause_if_full(&mut self) {
        if self.pending.len() >= self.buffer_max {
            self.paused = true;
        }
    }

    fn release_all(&mut self, release: Release) {
        for (_, waiter) in self.waiters.drain(..) {
            let _ = waiter.send(release);
        }
    }

    /// Answer a request that arrived after shutdown.
    fn refuse(&mut self, request: Request) {
        match request {
            Request::Accept { reply, .. } => {
                let _ = reply.send(Release::Wipe);
            }
            Request::Line { line, reply } => {
                let _ = reply.send(LineOutcome {
                    line,
                    repaired: false,
                    advanced: false,
                });
            }
            other => self.handle(other),
        }
    }
}

/// Actor loop. Cancellation wins over queued requests.
async fn gate_loop(
    mut state: GateState,
    mut rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => state.handle(request),
                None => break,
            },
        }
    }

    state.release_all(Release::Wipe);
    rx.close();
    while let Ok(request) = rx.try_recv() {
        state.refuse(request);
    }
    debug!("Gate closed");
}
