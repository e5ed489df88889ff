//! Flow control between the host and the device firmware.
//!
//! - [`FlowGate`]: actor that throttles outbound commands to the device's
//!   buffer depth and consumes its acknowledgments
//! - [`TelemetryRepairer`]: replaces corrupt telemetry lines

mod gate;
mod telemetry;

pub use gate::{
    Admission, FlowGate, GateConfig, GateStats, LineOutcome, Release, DEFAULT_ADMIT_DELAY,
    DEFAULT_ADVANCE_MARKERS, DEFAULT_BUFFER_MAX,
};
pub use telemetry::{
    ColumnKind, TelemetryConfig, TelemetryRepairer, TelemetrySchema, DEFAULT_HEADER_MARKER,
};
