//! Shared Status View
//!
//! Byte-exact snapshot record for out-of-process readers.

pub mod shared;

pub use shared::{
    SharedStatus, StatusReader, StatusWriter, SHARED_STATUS_MAGIC, SHARED_STATUS_SIZE,
    SHARED_STATUS_VERSION,
};
