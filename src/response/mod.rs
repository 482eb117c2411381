//! Incident Response
//!
//! - `incident.rs` - incident aggregate, state machine, JSON form
//! - `manager.rs` - lifecycle manager driven by derived events
//!
//! Containment actuators live outside the core; their contract is the
//! `ContainmentAction` event carrying an `action` of process_terminate,
//! process_suspend, network_block, or file_quarantine, plus `reason`,
//! `success`, and the target pid.

pub mod incident;
pub mod manager;

pub use incident::{ContainmentRecord, Incident, IncidentState, RiskSnapshot, StateTransition};
pub use manager::IncidentManager;
