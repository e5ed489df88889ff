//! Control line parsing.
//!
//! One command per line, whitespace separated:
//!
//! ```text
//! open <port> [baud] [dtrOn]
//! close <port>
//! send <port> <text...>
//! sendnobuf <port> <text...>
//! wipe <port>
//! list
//! ```

use crate::error::{BridgeError, Result};
use crate::transport::DEFAULT_BAUD;

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Open { port: String, baud: u32, dtr: bool },
    Close { port: String },
    Send { port: String, data: String },
    SendNoBuf { port: String, data: String },
    Wipe { port: String },
    List,
}

impl ControlCommand {
    /// Parse one control line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = split_word(line);

        match verb.to_ascii_lowercase().as_str() {
            "open" => {
                let (port, mut args) = require_port(verb, rest)?;
                let mut baud = DEFAULT_BAUD;
                let mut dtr = false;
                while !args.is_empty() {
                    let (arg, next) = split_word(args);
                    if arg.eq_ignore_ascii_case("dtron") {
                        dtr = true;
                    } else {
                        baud = arg.parse().map_err(|_| {
                            BridgeError::InvalidCommand(format!("bad open argument '{}'", arg))
                        })?;
                    }
                    args = next;
                }
                Ok(ControlCommand::Open { port, baud, dtr })
            }
            "close" => Ok(ControlCommand::Close {
                port: require_port(verb, rest)?.0,
            }),
            "wipe" => Ok(ControlCommand::Wipe {
                port: require_port(verb, rest)?.0,
            }),
            "send" => {
                let (port, data) = require_data(verb, rest)?;
                Ok(ControlCommand::Send { port, data })
            }
            "sendnobuf" => {
                let (port, data) = require_data(verb, rest)?;
                Ok(ControlCommand::SendNoBuf { port, data })
            }
            "list" => Ok(ControlCommand::List),
            "" => Err(BridgeError::InvalidCommand("empty command".into())),
            other => Err(BridgeError::InvalidCommand(format!(
                "unknown command '{}'",
                other
            ))),
        }
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn require_port<'a>(verb: &str, rest: &'a str) -> Result<(String, &'a str)> {
    let (port, rest) = split_word(rest);
    if port.is_empty() {
        return Err(BridgeError::InvalidCommand(format!("{} needs a port", verb)));
    }
    Ok((port.to_string(), rest))
}

fn require_data(verb: &str, rest: &str) -> Result<(String, String)> {
    let (port, data) = require_port(verb, rest)?;
    if data.is_empty() {
        return Err(BridgeError::InvalidCommand(format!("{} needs data", verb)));
    }
    Ok((port, data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open() {
        assert_eq!(
            ControlCommand::parse("open COM3").unwrap(),
            ControlCommand::Open {
                port: "COM3".into(),
                baud: 115_200,
                dtr: false
            }
        );
        assert_eq!(
            ControlCommand::parse("open /dev/ttyUSB0 dtrOn").unwrap(),
            ControlCommand::Open {
                port: "/dev/ttyUSB0".into(),
                baud: 115_200,
                dtr: true
            }
        );
        assert_eq!(
            ControlCommand::parse("open COM3 9600 dtrOn").unwrap(),
            ControlCommand::Open {
                port: "COM3".into(),
                baud: 9600,
                dtr: true
            }
        );
    }

    #[test]
    fn test_parse_send_keeps_spaces() {
        assert_eq!(
            ControlCommand::parse("send COM3 G0 X10  Y5").unwrap(),
            ControlCommand::Send {
                port: "COM3".into(),
                data: "G0 X10  Y5".into()
            }
        );
        assert_eq!(
            ControlCommand::parse("sendnobuf COM3 !").unwrap(),
            ControlCommand::SendNoBuf {
                port: "COM3".into(),
                data: "!".into()
            }
        );
    }

    #[test]
    fn test_parse_simple() {
        assert_eq!(ControlCommand::parse("list").unwrap(), ControlCommand::List);
        assert_eq!(
            ControlCommand::parse("  CLOSE COM3 ").unwrap(),
            ControlCommand::Close { port: "COM3".into() }
        );
        assert_eq!(
            ControlCommand::parse("wipe COM3").unwrap(),
            ControlCommand::Wipe { port: "COM3".into() }
        );
    }

    #[test]
    fn test_parse_errors() {
        for line in ["", "frobnicate", "open", "send COM3", "open COM3 fast"] {
            assert!(
                matches!(ControlCommand::parse(line), Err(BridgeError::InvalidCommand(_))),
                "line {:?} should fail",
                line
            );
        }
    }
}
