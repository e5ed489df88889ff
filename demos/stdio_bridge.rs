//! Stdio bridge - drive serial sessions from stdin.
//!
//! This example demonstrates:
//! - Running a [`SessionHub`] over real serial ports
//! - Feeding it control lines from stdin
//! - Printing every broadcast as a JSON line on stdout
//!
//! # Running
//!
//! ```text
//! $ RUST_LOG=serial_bridge=debug cargo run --example stdio_bridge
//! list
//! {"SerialPorts":[{"Name":"/dev/ttyUSB0","Vid":"0x1a86",...}]}
//! open /dev/ttyUSB0 dtrOn
//! {"Cmd":"Open","Desc":"Got register/open on port.","Port":"/dev/ttyUSB0","Baud":115200}
//! send /dev/ttyUSB0 G28
//! {"Cmd":"Write","QCnt":0,"Id":"ctl-1","D":"G28\n","Buf":"Buf","P":"/dev/ttyUSB0"}
//! ```
//!
//! Logs go to stderr so stdout stays machine readable.

use std::sync::Arc;

use serial_bridge::control::{run_stdio, SessionHub, StdoutSink};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let hub = SessionHub::new(Arc::new(StdoutSink));
    run_stdio(tokio::io::stdin(), &hub).await?;

    Ok(())
}
