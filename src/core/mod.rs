//! Core Infrastructure
//!
//! - `event.rs` - event record and kind enum
//! - `event_bus.rs` - typed pub/sub with sync and bounded-async dispatch
//! - `worker_pool.rs` - fixed-size pool backing the async path

pub mod event;
pub mod event_bus;
pub mod worker_pool;

pub use event::{current_timestamp_ms, iso8601_to_timestamp, timestamp_to_iso8601, Event, EventKind};
pub use event_bus::{EventBus, SubscriptionId};
pub use worker_pool::WorkerPool;
