//! Open sessions keyed by port name.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ControlCommand;
use crate::error::{BridgeError, Result};
use crate::flow::GateConfig;
use crate::session::{SerialSession, SessionBuilder, SessionConfig};
use crate::sink::{Broadcast, BroadcastSink, PortInfo, Report};
use crate::transport::{PortOpener, SerialOpener};

type SessionMap = Arc<Mutex<HashMap<String, Arc<SerialSession>>>>;

/// Registry of open sessions driven by control commands.
pub struct SessionHub {
    opener: Arc<dyn PortOpener>,
    sink: Arc<dyn BroadcastSink>,
    gate: GateConfig,
    sessions: SessionMap,
    /// Ports with an open in progress.
    opening: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl SessionHub {
    /// Hub over real serial devices.
    pub fn new(sink: Arc<dyn BroadcastSink>) -> Self {
        Self::with_opener(Arc::new(SerialOpener), sink)
    }

    /// Hub over a custom opener.
    pub fn with_opener(opener: Arc<dyn PortOpener>, sink: Arc<dyn BroadcastSink>) -> Self {
        Self {
            opener,
            sink,
            gate: GateConfig::default(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            opening: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Gate config used for every session opened from now on.
    pub fn gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    /// Open `port`. Busy ports and open failures are reported as `OpenFail`.
    pub async fn open(&self, port: &str, baud: u32, dtr: bool) -> Result<()> {
        if !self.reserve(port).await {
            warn!(port = %port, "Port already open");
            self.sink.broadcast(
                Report::OpenFail {
                    desc: "Error opening port. Port is already open.".to_string(),
                    port: port.to_string(),
                    baud,
                }
                .into(),
            );
            return Err(BridgeError::PortBusy(port.to_string()));
        }

        let config = SessionConfig {
            port: port.to_string(),
            baud,
            dtr,
            gate: self.gate.clone(),
            ..SessionConfig::default()
        };
        let result = SessionBuilder::from_config(config).open_with(self.opener.as_ref(), self.sink.clone());

        let outcome = match result {
            Ok(session) => {
                let session = Arc::new(session);
                self.sessions
                    .lock()
                    .await
                    .insert(port.to_string(), session.clone());
                supervise(Arc::downgrade(&session), self.sessions.clone());
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.opening.lock().await.remove(port);
        outcome
    }

    /// Close `port`.
    pub async fn close(&self, port: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(port)
            .ok_or_else(|| BridgeError::PortNotOpen(port.to_string()))?;
        session.close().await;
        Ok(())
    }

    /// Close every open session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    /// Queue `data` on `port`, appending a newline when missing.
    pub async fn send(&self, port: &str, data: &str, buffered: bool) -> Result<()> {
        let session = self.session(port).await?;
        let id = format!("ctl-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let data = if data.ends_with('\n') {
            data.to_string()
        } else {
            format!("{}\n", data)
        };

        if buffered {
            session.send(data, id).await
        } else {
            session.send_nobuf(data, id).await
        }
    }

    /// Wipe the gate queue of `port`.
    pub async fn wipe(&self, port: &str) -> Result<usize> {
        self.session(port).await?.wipe().await
    }

    /// Ports on the system, marked open when this hub holds them.
    pub async fn list(&self) -> Result<Vec<PortInfo>> {
        let mut ports = self.opener.list()?;
        let sessions = self.sessions.lock().await;
        for port in &mut ports {
            port.is_open = sessions.contains_key(&port.name);
        }
        Ok(ports)
    }

    /// True if a session is open on `port`.
    pub async fn is_open(&self, port: &str) -> bool {
        self.sessions.lock().await.contains_key(port)
    }

    /// Open session for `port`.
    pub async fn session(&self, port: &str) -> Result<Arc<SerialSession>> {
        self.sessions
            .lock()
            .await
            .get(port)
            .cloned()
            .ok_or_else(|| BridgeError::PortNotOpen(port.to_string()))
    }

    /// Run one parsed command.
    pub async fn execute(&self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::Open { port, baud, dtr } => self.open(&port, baud, dtr).await,
            ControlCommand::Close { port } => self.close(&port).await,
            ControlCommand::Send { port, data } => self.send(&port, &data, true).await,
            ControlCommand::SendNoBuf { port, data } => self.send(&port, &data, false).await,
            ControlCommand::Wipe { port } => self.wipe(&port).await.map(|_| ()),
            ControlCommand::List => {
                let ports = self.list().await?;
                self.sink.broadcast(Broadcast::Ports { ports });
                Ok(())
            }
        }
    }

    /// Parse and run one control line, broadcasting any failure.
    pub async fn handle_line(&self, line: &str) {
        let command = match ControlCommand::parse(line) {
            Ok(command) => command,
            Err(e) => {
                self.sink.broadcast(Broadcast::error(e.to_string()));
                return;
            }
        };

        debug!(?command, "Control command");
        let reported_by_open = matches!(command, ControlCommand::Open { .. });
        if let Err(e) = self.execute(command).await {
            // Open failures already went out as OpenFail.
            if !reported_by_open {
                self.sink.broadcast(Broadcast::error(e.to_string()));
            }
        }
    }

    async fn reserve(&self, port: &str) -> bool {
        let mut opening = self.opening.lock().await;
        if opening.contains(port) || self.sessions.lock().await.contains_key(port) {
            return false;
        }
        opening.insert(port.to_string());
        true
    }
}

/// Close and forget a session once it faults.
fn supervise(session: Weak<SerialSession>, sessions: SessionMap) {
    let Some(mut exit) = session.upgrade().map(|s| s.exit_watch()) else {
        return;
    };

    tokio::spawn(async move {
        let reason = match exit.wait_for(|e| e.is_some()).await {
            Ok(reason) => reason.clone(),
            // Session dropped.
            Err(_) => return,
        };
        let Some(reason) = reason.filter(|r| r.is_fault()) else {
            return;
        };
        let Some(session) = session.upgrade() else {
            return;
        };

        warn!(port = %session.port(), ?reason, "Session faulted, closing");
        {
            let mut map = sessions.lock().await;
            if map
                .get(session.port())
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                map.remove(session.port());
            }
        }
        session.close().await;
        info!(port = %session.port(), "Faulted session removed");
    });
}
