//! Transport module - the byte stream under a session.
//!
//! Sessions run over any [`Port`]. Real devices are opened with
//! [`SerialOpener`] (tokio-serial); tests substitute in-memory streams.

mod serial;

pub use serial::{
    list_ports, open_serial, BoxedPort, Port, PortOpener, PortSettings, SerialOpener,
    DEFAULT_BAUD,
};
