//! Compliance Evidence
//!
//! The HMAC-chained audit trail and its export form.

pub mod audit;

pub use audit::{AuditError, AuditLogger, GENESIS_HASH};
