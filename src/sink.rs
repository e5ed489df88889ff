//! Broadcast messages and the sink they are delivered to.
//!
//! Everything the bridge reports to its clients goes through a
//! [`BroadcastSink`] supplied at construction. Messages serialize to the JSON
//! shapes the clients already understand (PascalCase keys, `Cmd` tag).
//!
//! # Example
//!
//! ```
//! use serial_bridge::sink::{Broadcast, Report};
//!
//! let msg = Broadcast::Report(Report::CompleteFake {
//!     id: "c1".into(),
//!     port: "/dev/ttyUSB0".into(),
//!     data: "G0 X10\n".into(),
//! });
//! let json = msg.to_json().unwrap();
//! assert!(json.starts_with(r#"{"Cmd":"CompleteFake","Id":"c1""#));
//! ```

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;

/// Whether a command went through the flow gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufMode {
    Buf,
    NoBuf,
}

/// Command-tagged reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "Cmd")]
pub enum Report {
    /// A command is about to be written to the device.
    Write {
        #[serde(rename = "QCnt")]
        queued: usize,
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "D")]
        data: String,
        #[serde(rename = "Buf")]
        buf: BufMode,
        #[serde(rename = "P")]
        port: String,
    },
    /// Synthesized completion for a written command.
    CompleteFake {
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "P")]
        port: String,
        #[serde(rename = "D")]
        data: String,
    },
    /// A validated frame no handler claimed.
    Frame {
        #[serde(rename = "P")]
        port: String,
        #[serde(rename = "Seq")]
        sequence: u8,
        #[serde(rename = "Command")]
        command: u8,
        /// Stuffed length from the wire.
        #[serde(rename = "Length")]
        length: u16,
        #[serde(rename = "Payload")]
        payload: Vec<u8>,
    },
    /// A frame was dropped by the assembler or codec.
    FrameError {
        #[serde(rename = "P")]
        port: String,
        #[serde(rename = "Kind")]
        kind: String,
        #[serde(rename = "Desc")]
        desc: String,
    },
    Open {
        #[serde(rename = "Desc")]
        desc: String,
        #[serde(rename = "Port")]
        port: String,
        #[serde(rename = "Baud")]
        baud: u32,
    },
    OpenFail {
        #[serde(rename = "Desc")]
        desc: String,
        #[serde(rename = "Port")]
        port: String,
        #[serde(rename = "Baud")]
        baud: u32,
    },
    Close {
        #[serde(rename = "Desc")]
        desc: String,
        #[serde(rename = "Port")]
        port: String,
    },
    /// The gate queue was wiped.
    WipedQueue {
        #[serde(rename = "QCnt")]
        queued: usize,
        #[serde(rename = "P")]
        port: String,
    },
    /// Worker lifecycle notices.
    Status {
        #[serde(rename = "P")]
        port: String,
        #[serde(rename = "Desc")]
        desc: String,
    },
}

/// One entry of a port listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Vid")]
    pub vid: String,
    #[serde(rename = "Pid")]
    pub pid: String,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "Manufacturer")]
    pub manufacturer: String,
    #[serde(rename = "IsOpen")]
    pub is_open: bool,
}

/// Every message shape delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Broadcast {
    Report(Report),
    /// A device text line, newline included.
    Data {
        #[serde(rename = "P")]
        port: String,
        #[serde(rename = "D")]
        data: String,
    },
    /// A control request failed.
    Error { error: String },
    Ports {
        #[serde(rename = "SerialPorts")]
        ports: Vec<PortInfo>,
    },
}

impl Broadcast {
    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Shorthand for an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Broadcast::Error {
            error: message.into(),
        }
    }

    /// Shorthand for a status report.
    pub fn status(port: &str, desc: impl Into<String>) -> Self {
        Broadcast::Report(Report::Status {
            port: port.to_string(),
            desc: desc.into(),
        })
    }
}

impl From<Report> for Broadcast {
    fn from(report: Report) -> Self {
        Broadcast::Report(report)
    }
}

/// Destination for broadcast messages.
///
/// Implementations must not block; the workers call this inline.
pub trait BroadcastSink: Send + Sync + 'static {
    fn broadcast(&self, message: Broadcast);
}

impl<F> BroadcastSink for F
where
    F: Fn(Broadcast) + Send + Sync + 'static,
{
    fn broadcast(&self, message: Broadcast) {
        self(message)
    }
}

impl BroadcastSink for mpsc::UnboundedSender<Broadcast> {
    fn broadcast(&self, message: Broadcast) {
        // Receiver gone means nobody is listening.
        let _ = self.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn value(message: Broadcast) -> Value {
        serde_json::from_str(&message.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_write_report_shape() {
        let msg = Report::Write {
            queued: 3,
            id: "c1".into(),
            data: "G0 X10\n".into(),
            buf: BufMode::Buf,
            port: "COM3".into(),
        };
        assert_eq!(
            value(msg.into()),
            json!({"Cmd":"Write","QCnt":3,"Id":"c1","D":"G0 X10\n","Buf":"Buf","P":"COM3"})
        );
    }

    #[test]
    fn test_nobuf_mode() {
        let msg = Report::Write {
            queued: 0,
            id: "x".into(),
            data: "?".into(),
            buf: BufMode::NoBuf,
            port: "p".into(),
        };
        assert_eq!(value(msg.into())["Buf"], "NoBuf");
    }

    #[test]
    fn test_complete_fake_shape() {
        let msg = Report::CompleteFake {
            id: "c1".into(),
            port: "COM3".into(),
            data: "G0\n".into(),
        };
        assert_eq!(
            value(msg.into()),
            json!({"Cmd":"CompleteFake","Id":"c1","P":"COM3","D":"G0\n"})
        );
    }

    #[test]
    fn test_open_fail_shape() {
        let msg = Report::OpenFail {
            desc: "Error opening port. busy".into(),
            port: "COM3".into(),
            baud: 115200,
        };
        assert_eq!(
            value(msg.into()),
            json!({"Cmd":"OpenFail","Desc":"Error opening port. busy","Port":"COM3","Baud":115200})
        );
    }

    #[test]
    fn test_frame_report_shape() {
        let msg = Report::Frame {
            port: "p".into(),
            sequence: 1,
            command: 4,
            length: 2,
            payload: vec![16, 0],
        };
        assert_eq!(
            value(msg.into()),
            json!({"Cmd":"Frame","P":"p","Seq":1,"Command":4,"Length":2,"Payload":[16,0]})
        );
    }

    #[test]
    fn test_data_line_shape() {
        let msg = Broadcast::Data {
            port: "p".into(),
            data: "10\tA\tB\n".into(),
        };
        assert_eq!(value(msg), json!({"P":"p","D":"10\tA\tB\n"}));
    }

    #[test]
    fn test_error_shape() {
        assert_eq!(value(Broadcast::error("nope")), json!({"error":"nope"}));
    }

    #[test]
    fn test_port_list_shape() {
        let msg = Broadcast::Ports {
            ports: vec![PortInfo {
                name: "/dev/ttyACM0".into(),
                vid: "0x2341".into(),
                pid: "0x0043".into(),
                serial_number: String::new(),
                manufacturer: "Arduino".into(),
                is_open: false,
            }],
        };
        let v = value(msg);
        assert_eq!(v["SerialPorts"][0]["Name"], "/dev/ttyACM0");
        assert_eq!(v["SerialPorts"][0]["Vid"], "0x2341");
    }

    #[test]
    fn test_closure_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = move |msg: Broadcast| {
            let _ = tx.send(msg);
        };
        sink.broadcast(Broadcast::error("x"));
        assert_eq!(rx.try_recv().unwrap(), Broadcast::error("x"));
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel::<Broadcast>();
        drop(rx);
        tx.broadcast(Broadcast::error("dropped"));
    }
}
