//! HostShield Core - Detection & Response Pipeline
//!
//! Host-resident EDR engine:
//! - Collector events fan out through the typed event bus
//! - The risk scorer, rule engine, and behavior correlator derive
//!   `RiskThresholdExceeded` / pattern detections from raw telemetry
//! - The incident manager materialises incidents and walks their lifecycle
//! - Every derived action lands in the HMAC-chained audit trail
//! - Telemetry, incidents, and the audit chain persist to SQLite (WAL)
//! - A packed, mmap'd status record serves out-of-process readers
//!
//! Collectors and containment actuators are external collaborators: they
//! publish well-formed events to the bus and report outcomes as
//! `ContainmentAction` events.

pub mod compliance;
pub mod constants;
pub mod core;
pub mod engine;
pub mod persistence;
pub mod response;
pub mod status;
pub mod telemetry;
