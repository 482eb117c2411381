//! Central Configuration Constants
//!
//! Single source of truth for all engine defaults. Every value can be
//! overridden through an environment variable read by the matching helper.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Engine name
pub const APP_NAME: &str = "HostShield";

/// Engine version (written into the shared status record)
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Worker threads for async event dispatch
pub const DEFAULT_ASYNC_POOL_SIZE: usize = 2;

/// Shared status refresh interval (seconds)
pub const DEFAULT_STATUS_REFRESH_SECS: u64 = 2;

/// Default risk level thresholds
pub const DEFAULT_THRESHOLD_LOW: u32 = 30;
pub const DEFAULT_THRESHOLD_MEDIUM: u32 = 60;
pub const DEFAULT_THRESHOLD_HIGH: u32 = 80;
pub const DEFAULT_THRESHOLD_CRITICAL: u32 = 100;

/// Default audit secret when HOSTSHIELD_AUDIT_SECRET is not set.
/// Deployments are expected to override this.
const DEFAULT_AUDIT_SECRET: &str = "hostshield-dev-audit-secret-change-in-production";

/// Data directory name under the platform-local app data root
const DATA_DIR_NAME: &str = "hostshield";

// ============================================
// Helper functions to read from env with fallback
// ============================================

/// Root data directory: HOSTSHIELD_DATA_DIR or the platform-local default
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HOSTSHIELD_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

/// Database file path
pub fn get_db_path() -> PathBuf {
    std::env::var("HOSTSHIELD_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| get_data_dir().join("hostshield.db"))
}

/// Detection rules file path
pub fn get_rules_path() -> PathBuf {
    std::env::var("HOSTSHIELD_RULES_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| get_data_dir().join("rules.yaml"))
}

/// Directory for per-incident JSON files
pub fn get_incidents_dir() -> PathBuf {
    std::env::var("HOSTSHIELD_INCIDENTS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| get_data_dir().join("incidents"))
}

/// Directory for the JSONL event stream
pub fn get_stream_dir() -> PathBuf {
    std::env::var("HOSTSHIELD_STREAM_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| get_data_dir().join("event_stream"))
}

/// Shared status snapshot file path
pub fn get_status_path() -> PathBuf {
    std::env::var("HOSTSHIELD_STATUS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| get_data_dir().join("status.bin"))
}

/// Status refresh interval from environment or default
pub fn get_status_refresh_secs() -> u64 {
    std::env::var("HOSTSHIELD_STATUS_REFRESH_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_STATUS_REFRESH_SECS)
}

/// 256-bit audit chain key, derived from HOSTSHIELD_AUDIT_SECRET (or the
/// development default) with SHA-256.
pub fn get_audit_key() -> Vec<u8> {
    let secret =
        std::env::var("HOSTSHIELD_AUDIT_SECRET").unwrap_or_else(|_| DEFAULT_AUDIT_SECRET.to_string());
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}
