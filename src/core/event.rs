//! Telemetry Event Types
//!
//! Immutable, timestamped events flowing through the bus. Raw events come
//! from collectors; derived events are emitted by the analysis engines.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Categories of telemetry and derived events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ProcessCreate,
    ProcessTerminate,
    FileCreate,
    FileModify,
    FileDelete,
    NetworkConnect,
    NetworkDisconnect,
    RegistryWrite,
    /// A rule match or risk level escalation
    RiskThresholdExceeded,
    /// An incident transition or a detected behavior pattern
    IncidentStateChange,
    /// Outcome reported by a containment actuator
    ContainmentAction,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProcessCreate => "PROCESS_CREATE",
            EventKind::ProcessTerminate => "PROCESS_TERMINATE",
            EventKind::FileCreate => "FILE_CREATE",
            EventKind::FileModify => "FILE_MODIFY",
            EventKind::FileDelete => "FILE_DELETE",
            EventKind::NetworkConnect => "NETWORK_CONNECT",
            EventKind::NetworkDisconnect => "NETWORK_DISCONNECT",
            EventKind::RegistryWrite => "REGISTRY_WRITE",
            EventKind::RiskThresholdExceeded => "RISK_THRESHOLD_EXCEEDED",
            EventKind::IncidentStateChange => "INCIDENT_STATE_CHANGE",
            EventKind::ContainmentAction => "CONTAINMENT_ACTION",
        }
    }

    pub fn from_str(s: &str) -> Option<EventKind> {
        match s {
            "PROCESS_CREATE" => Some(EventKind::ProcessCreate),
            "PROCESS_TERMINATE" => Some(EventKind::ProcessTerminate),
            "FILE_CREATE" => Some(EventKind::FileCreate),
            "FILE_MODIFY" => Some(EventKind::FileModify),
            "FILE_DELETE" => Some(EventKind::FileDelete),
            "NETWORK_CONNECT" => Some(EventKind::NetworkConnect),
            "NETWORK_DISCONNECT" => Some(EventKind::NetworkDisconnect),
            "REGISTRY_WRITE" => Some(EventKind::RegistryWrite),
            "RISK_THRESHOLD_EXCEEDED" => Some(EventKind::RiskThresholdExceeded),
            "INCIDENT_STATE_CHANGE" => Some(EventKind::IncidentStateChange),
            "CONTAINMENT_ACTION" => Some(EventKind::ContainmentAction),
        _ => None,
        }
    }

    /// Kinds produced by collectors (as opposed to derived by analysers)
    pub const COLLECTOR_KINDS: [EventKind; 8] = [
        EventKind::ProcessCreate,
        EventKind::ProcessTerminate,
        EventKind::FileCreate,
        EventKind::FileModify,
        EventKind::FileDelete,
        EventKind::NetworkConnect,
        EventKind::NetworkDisconnect,
        EventKind::RegistryWrite,
    ];
}

/// A single telemetry event.
///
/// The timestamp is fixed at construction and never rewritten; subscribers
/// treat the whole record as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Epoch milliseconds, UTC
    pub timestamp: u64,
    /// 0 when not applicable
    pub pid: u32,
    pub process_name: String,
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, pid: u32, process_name: &str) -> Self {
        Self {
            kind,
            timestamp: current_timestamp_ms(),
            pid,
            process_name: process_name.to_string(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|v| v.as_str())
    }
}

/// Current wall-clock time as epoch milliseconds
pub fn current_timestamp_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Epoch milliseconds to `YYYY-MM-DDTHH:MM:SS.sssZ`
pub fn timestamp_to_iso8601(ms: u64) -> String {
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => String::from("1970-01-01T00:00:00.000Z"),
    }
}

/// Parse an ISO-8601 timestamp back to epoch milliseconds
pub fn iso8601_to_timestamp(s: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis() as u64)
}

/// `YYYY-MM-DD` date component, used for incident file names
pub fn timestamp_to_date_string(ms: u64) -> String {
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => String::from("1970-01-01"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = Event::new(EventKind::ProcessCreate, 1234, "notepad.exe")
            .with_meta("image_path", "C:\\Windows\\notepad.exe");
        assert_eq!(event.kind, EventKind::ProcessCreate);
        assert_eq!(event.pid, 1234);
        assert_eq!(event.meta("image_path"), Some("C:\\Windows\\notepad.exe"));
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in EventKind::COLLECTOR_KINDS {
            assert_eq!(EventKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_str("NOT_A_KIND"), None);
    }

    #[test]
    fn test_iso8601_round_trip() {
        let ms = 1_700_000_000_123u64;
        let iso = timestamp_to_iso8601(ms);
        assert!(iso.ends_with('Z'));
        assert_eq!(iso8601_to_timestamp(&iso), Some(ms));
    }

    #[test]
    fn test_iso8601_millisecond_precision() {
        assert_eq!(timestamp_to_iso8601(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(timestamp_to_iso8601(1), "1970-01-01T00:00:00.001Z");
    }
}
