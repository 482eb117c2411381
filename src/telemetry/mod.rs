//! Telemetry
//!
//! Event persistence and the JSONL stream consumed by out-of-process tooling.

pub mod exporter;

pub use exporter::{read_stream, TelemetryExporter};
