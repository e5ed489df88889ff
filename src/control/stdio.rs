//! Stdio driver for the control channel.
//!
//! # Important
//!
//! - **stdin**: control commands, one per line
//! - **stdout**: broadcast messages as JSON (one per line)
//! - **stderr**: logs, never parsed
//! - **Never use `println!`**: it may add `\r\n` on Windows
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serial_bridge::control::{run_stdio, SessionHub, StdoutSink};
//!
//! let hub = SessionHub::new(Arc::new(StdoutSink));
//! run_stdio(tokio::io::stdin(), &hub).await?;
//! ```

use std::io::Write;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info};

use super::SessionHub;
use crate::error::Result;
use crate::sink::{Broadcast, BroadcastSink};

/// Write a line to stdout.
///
/// Writes the string followed by a single `\n` and flushes.
///
/// # Errors
///
/// Returns IO error if write or flush fails.
pub fn write_stdout_line(line: &str) -> std::io::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.write_all(b"\n")?;
    handle.flush()?;
    Ok(())
}

/// Write a JSON value to stdout as a single line.
pub fn write_stdout_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    write_stdout_line(&json)?;
    Ok(())
}

/// Sink that prints every broadcast as a JSON line on stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl BroadcastSink for StdoutSink {
    fn broadcast(&self, message: Broadcast) {
        if let Err(e) = write_stdout_json(&message) {
            error!("Failed to write broadcast: {}", e);
        }
    }
}

/// Feed control lines from `input` to `hub` until end of input, then close
/// every session.
pub async fn run_stdio<R>(input: R, hub: &SessionHub) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        hub.handle_line(&line).await;
    }

    info!("Control input closed, shutting down");
    hub.close_all().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_write_stdout_line_does_not_panic() {
        let result = write_stdout_line(r#"{"test": true}"#);
        assert!(result.is_ok());
    }

    #[test]
    fn test_stdout_sink_serializes() {
        StdoutSink.broadcast(Broadcast::status("ttyTEST", "hello"));
    }

    #[tokio::test]
    async fn test_run_stdio_handles_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = SessionHub::new(Arc::new(tx));

        let input: &[u8] = b"\nbogus\nclose ttyNONE\n";
        run_stdio(input, &hub).await.unwrap();

        let mut errors = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, Broadcast::Error { .. }) {
                errors += 1;
            }
        }
        assert_eq!(errors, 2);
    }
}
