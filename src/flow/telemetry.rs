//! Telemetry line validation and repair.
//!
//! The device streams tab-separated status lines. A line that does not match
//! the column schema is replaced by the last good line with its time column
//! bumped by one, so downstream consumers always see a well-formed row.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Numeric column pattern: optional sign, digits, optional fraction.
const NUMBER: &str = r"-?[0-9]\d*(?:\.\d+)?";

/// Column count of the device log format.
const LOG_LEADING_COLUMNS: usize = 29;
const LOG_TRAILING_COLUMNS: usize = 6;

/// Default header marker that arms repair.
pub const DEFAULT_HEADER_MARKER: &str = "Time";

/// Shape of one telemetry column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// A signed decimal number.
    Number,
    /// A number or an empty field.
    OptionalNumber,
    /// A status word (`\w+`).
    Word,
}

impl ColumnKind {
    fn pattern(self) -> String {
        match self {
            ColumnKind::Number => NUMBER.to_string(),
            ColumnKind::OptionalNumber => format!("(?:{})?", NUMBER),
            ColumnKind::Word => r"\w+".to_string(),
        }
    }
}

/// Ordered column shapes of a telemetry line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySchema {
    pub columns: Vec<ColumnKind>,
}

impl TelemetrySchema {
    /// Schema from an explicit column list.
    pub fn new(columns: Vec<ColumnKind>) -> Self {
        Self { columns }
    }

    /// The device log format: 29 numbers, a status word, 6 numbers.
    pub fn device_log() -> Self {
        let mut columns = vec![ColumnKind::Number; LOG_LEADING_COLUMNS];
        columns.push(ColumnKind::Word);
        columns.extend(std::iter::repeat(ColumnKind::Number).take(LOG_TRAILING_COLUMNS));
        Self { columns }
    }

    /// Compile the schema into an anchored line validator.
    ///
    /// A single trailing tab is tolerated.
    pub fn compile(&self) -> Result<Regex> {
        let body = self
            .columns
            .iter()
            .map(|c| c.pattern())
            .collect::<Vec<_>>()
            .join("\t");
        Ok(Regex::new(&format!("^{}\t?$", body))?)
    }
}

impl Default for TelemetrySchema {
    fn default() -> Self {
        Self::device_log()
    }
}

/// Telemetry repair settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Column schema used to validate lines.
    pub schema: TelemetrySchema,
    /// First field of the header line that arms repair.
    /// `None` arms repair from the first line.
    pub header_marker: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            schema: TelemetrySchema::default(),
            header_marker: Some(DEFAULT_HEADER_MARKER.to_string()),
        }
    }
}

/// Stateful repairer. Owned by the gate actor.
#[derive(Debug)]
pub struct TelemetryRepairer {
    validator: Regex,
    header_marker: Option<String>,
    armed: bool,
    previous: Option<String>,
    repairs: u64,
}

impl TelemetryRepairer {
    /// Build a repairer from config.
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        Ok(Self {
            validator: config.schema.compile()?,
            header_marker: config.header_marker.clone(),
            armed: config.header_marker.is_none(),
            previous: None,
            repairs: 0,
        })
    }

    /// True if the line matches the schema.
    pub fn is_valid(&self, line: &str) -> bool {
        self.validator.is_match(line)
    }

    /// Number of lines replaced so far.
    pub fn repairs(&self) -> u64 {
        self.repairs
    }

    /// True once the header line has been seen.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Feed one line (without its newline).
    ///
    /// Returns `Some(replacement)` when the line was repaired, `None` when it
    /// should be forwarded as is.
    pub fn ingest(&mut self, line: &str) -> Option<String> {
        if !self.armed {
            if let Some(marker) = &self.header_marker {
                if line.split('\t').next() == Some(marker.as_str()) {
                    self.armed = true;
                }
            }
            return None;
        }

        if self.is_valid(line) {
            self.previous = Some(line.to_string());
            return None;
        }

        let previous = self.previous.as_deref()?;
        let repaired = bump_time(previous);
        warn!(line = %line, repaired = %repaired, "Corrupt telemetry line replaced");

        self.repairs += 1;
        self.previous = Some(repaired.clone());
        Some(repaired)
    }
}

/// Copy of `line` with its first column incremented by one.
fn bump_time(line: &str) -> String {
    let (time, rest) = match line.split_once('\t') {
        Some((time, rest)) => (time, Some(rest)),
        None => (line, None),
    };

    let bumped = if let Ok(t) = time.parse::<i64>() {
        (t + 1).to_string()
    } else if let Ok(t) = time.parse::<f64>() {
        (t + 1.0).to_string()
    } else {
        "1".to_string()
    };

    match rest {
        Some(rest) => format!("{}\t{}", bumped, rest),
        None => bumped,
    }
}
