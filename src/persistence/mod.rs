//! Durable Persistence
//!
//! SQLite-backed storage for the event log, incident records, and the audit
//! chain.

pub mod store;

pub use store::{AuditEntryRow, StatusSnapshot, Store, StoreError};
