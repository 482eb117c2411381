//! Incident Types
//!
//! The incident aggregate, its lifecycle state machine, and the JSON form
//! shared by the database rows and the per-incident files on disk.

use crate::core::event::{iso8601_to_timestamp, timestamp_to_iso8601, Event, EventKind};
use crate::core::current_timestamp_ms;
use crate::engine::risk_scorer::RiskLevel;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentState {
    New,
    Investigating,
    Active,
    Contained,
    Closed,
    Escalated,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::New => "NEW",
            IncidentState::Investigating => "INVESTIGATING",
            IncidentState::Active => "ACTIVE",
            IncidentState::Contained => "CONTAINED",
            IncidentState::Closed => "CLOSED",
            IncidentState::Escalated => "ESCALATED",
        }
    }

    pub fn from_str(s: &str) -> IncidentState {
        match s {
            "INVESTIGATING" => IncidentState::Investigating,
            "ACTIVE" => IncidentState::Active,
            "CONTAINED" => IncidentState::Contained,
            "CLOSED" => IncidentState::Closed,
            "ESCALATED" => IncidentState::Escalated,
            _ => IncidentState::New,
        }
    }

    /// The lifecycle state machine. Everything not listed here is rejected.
    pub fn can_transition_to(&self, to: IncidentState) -> bool {
        match self {
            IncidentState::New => to == IncidentState::Investigating,
            IncidentState::Investigating => {
                to == IncidentState::Active || to == IncidentState::Closed
            }
            IncidentState::Active => {
                to == IncidentState::Contained
                    || to == IncidentState::Escalated
                    || to == IncidentState::Closed
            }
            IncidentState::Escalated => {
                to == IncidentState::Contained || to == IncidentState::Closed
            }
            IncidentState::Contained => to == IncidentState::Closed,
            IncidentState::Closed => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: IncidentState,
    pub to_state: IncidentState,
    pub timestamp: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub score: u32,
    pub level: RiskLevel,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainmentRecord {
    pub action: String,
    pub success: bool,
    pub timestamp: u64,
    pub details: String,
}

/// Materialised case record for one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub uuid: Uuid,
    pub pid: u32,
    pub process_name: String,
    pub state: IncidentState,
    pub associated_events: Vec<Event>,
    pub risk_timeline: Vec<RiskSnapshot>,
    pub containment_actions: Vec<ContainmentRecord>,
    pub state_history: Vec<StateTransition>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Incident {
    pub fn new(pid: u32, process_name: &str) -> Self {
        let now = current_timestamp_ms();
        Self {
            uuid: Uuid::new_v4(),
            pid,
            process_name: process_name.to_string(),
            state: IncidentState::New,
            associated_events: Vec::new(),
            risk_timeline: Vec::new(),
            containment_actions: Vec::new(),
            state_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state != IncidentState::Closed
    }

    /// File name for the on-disk JSON form: `YYYY-MM-DD_<uuid>.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.json",
            crate::core::event::timestamp_to_date_string(self.created_at),
            self.uuid
        )
    }

    // --- JSON form (database columns and incident files) ---

    pub fn to_json(&self) -> Value {
        json!({
            "uuid": self.uuid.to_string(),
            "pid": self.pid,
            "process_name": &self.process_name,
            "state": self.state.as_str(),
            "created_at": timestamp_to_iso8601(self.created_at),
            "updated_at": timestamp_to_iso8601(self.updated_at),
            "associated_events": self.events_to_json(),
            "risk_timeline": self.risk_to_json(),
            "containment_actions": self.actions_to_json(),
            "state_history": self.history_to_json(),
        })
    }

    pub fn events_to_json(&self) -> Value {
        Value::Array(
            self.associated_events
                .iter()
                .map(|event| {
                    json!({
                        "event_type": event.kind.as_str(),
                        "timestamp": timestamp_to_iso8601(event.timestamp),
                        "pid": event.pid,
                        "process_name": &event.process_name,
                        "metadata": &event.metadata,
                    })
                })
                .collect(),
        )
    }

    pub fn risk_to_json(&self) -> Value {
        Value::Array(
            self.risk_timeline
                .iter()
                .map(|snap| {
                    json!({
                        "score": snap.score,
                        "level": snap.level.as_str(),
                        "timestamp": timestamp_to_iso8601(snap.timestamp),
                    })
                })
                .collect(),
        )
    }

    pub fn actions_to_json(&self) -> Value {
        Value::Array(
            self.containment_actions
                .iter()
                .map(|record| {
                    json!({
                        "action": &record.action,
                        "success": record.success,
                        "timestamp": timestamp_to_iso8601(record.timestamp),
                        "details": &record.details,
                    })
                })
                .collect(),
        )
    }

    pub fn history_to_json(&self) -> Value {
        Value::Array(
            self.state_history
                .iter()
                .map(|transition| {
                    json!({
                        "from": transition.from_state.as_str(),
                        "to": transition.to_state.as_str(),
                        "timestamp": timestamp_to_iso8601(transition.timestamp),
                        "reason": &transition.reason,
                    })
                })
                .collect(),
        )
    }

    /// Rebuild an incident from its stored columns. Timestamps round-trip
    /// through the ISO-8601 text form at millisecond precision.
    pub fn from_columns(
        uuid: &str,
        pid: u32,
        process_name: &str,
        state: &str,
        created_at: &str,
        updated_at: &str,
        events_json: &str,
        risk_json: &str,
        actions_json: &str,
        history_json: &str,
    ) -> Option<Incident> {
        let uuid = Uuid::parse_str(uuid).ok()?;
        Some(Incident {
            uuid,
            pid,
            process_name: process_name.to_string(),
            state: IncidentState::from_str(state),
            associated_events: parse_events(events_json),
            risk_timeline: parse_risk_timeline(risk_json),
            containment_actions: parse_containment(actions_json),
            state_history: parse_history(history_json),
            created_at: iso8601_to_timestamp(created_at).unwrap_or(0),
            updated_at: iso8601_to_timestamp(updated_at).unwrap_or(0),
        })
    }
}

fn parse_events(raw: &str) -> Vec<Event> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let kind = EventKind::from_str(item.get("event_type")?.as_str()?)?;
            let mut metadata = HashMap::new();
            if let Some(meta) = item.get("metadata").and_then(|m| m.as_object()) {
                for (key, value) in meta {
                    if let Some(value) = value.as_str() {
                        metadata.insert(key.clone(), value.to_string());
                    }
                }
            }
            Some(Event {
                kind,
                timestamp: item
                    .get("timestamp")
                    .and_then(|t| t.as_str())
                    .and_then(iso8601_to_timestamp)
                    .unwrap_or(0),
                pid: item.get("pid").and_then(|p| p.as_u64()).unwrap_or(0) as u32,
                process_name: item
                    .get("process_name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("")
                    .to_string(),
                metadata,
            })
        })
        .collect()
}

fn parse_risk_timeline(raw: &str) -> Vec<RiskSnapshot> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| RiskSnapshot {
            score: item.get("score").and_then(|s| s.as_u64()).unwrap_or(0) as u32,
            level: RiskLevel::from_str(item.get("level").and_then(|l| l.as_str()).unwrap_or("LOW")),
            timestamp: item
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(iso8601_to_timestamp)
                .unwrap_or(0),
        })
        .collect()
}

fn parse_containment(raw: &str) -> Vec<ContainmentRecord> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| ContainmentRecord {
            action: item
                .get("action")
                .and_then(|a| a.as_str())
                .unwrap_or("unknown")
                .to_string(),
            success: item.get("success").and_then(|s| s.as_bool()).unwrap_or(false),
            timestamp: item
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(iso8601_to_timestamp)
                .unwrap_or(0),
            details: item
                .get("details")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string(),
        })
        .collect()
}

fn parse_history(raw: &str) -> Vec<StateTransition> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| StateTransition {
            from_state: IncidentState::from_str(
                item.get("from").and_then(|f| f.as_str()).unwrap_or("NEW"),
            ),
            to_state: IncidentState::from_str(
                item.get("to").and_then(|t| t.as_str()).unwrap_or("NEW"),
            ),
            timestamp: item
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(iso8601_to_timestamp)
                .unwrap_or(0),
            reason: item
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use IncidentState::*;
        assert!(New.can_transition_to(Investigating));
        assert!(!New.can_transition_to(Active));
        assert!(Investigating.can_transition_to(Active));
        assert!(Investigating.can_transition_to(Closed));
        assert!(!Investigating.can_transition_to(Contained));
        assert!(Active.can_transition_to(Contained));
        assert!(Active.can_transition_to(Escalated));
        assert!(Active.can_transition_to(Closed));
        assert!(Escalated.can_transition_to(Contained));
        assert!(Escalated.can_transition_to(Closed));
        assert!(Contained.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(New));
        assert!(!Closed.can_transition_to(Investigating));
    }

    #[test]
    fn test_json_round_trip_preserves_all_fields() {
        let mut incident = Incident::new(42, "dropper.exe");
        incident.state = IncidentState::Active;
        incident.associated_events.push(
            Event::new(EventKind::NetworkConnect, 42, "dropper.exe")
                .with_meta("remote_address", "8.8.8.8")
                .with_meta("remote_port", "4444"),
        );
        incident.risk_timeline.push(RiskSnapshot {
            score: 60,
            level: RiskLevel::Medium,
            timestamp: current_timestamp_ms(),
        });
        incident.containment_actions.push(ContainmentRecord {
            action: "process_terminate".to_string(),
            success: true,
            timestamp: current_timestamp_ms(),
            details: "terminated by actuator".to_string(),
        });
        incident.state_history.push(StateTransition {
            from_state: IncidentState::New,
            to_state: IncidentState::Investigating,
            timestamp: current_timestamp_ms(),
            reason: "risk crossed threshold".to_string(),
        });

        let json = incident.to_json();
        let restored = Incident::from_columns(
            json["uuid"].as_str().unwrap(),
            json["pid"].as_u64().unwrap() as u32,
            json["process_name"].as_str().unwrap(),
            json["state"].as_str().unwrap(),
            json["created_at"].as_str().unwrap(),
            json["updated_at"].as_str().unwrap(),
            &json["associated_events"].to_string(),
            &json["risk_timeline"].to_string(),
            &json["containment_actions"].to_string(),
            &json["state_history"].to_string(),
        )
        .unwrap();

        assert_eq!(restored.uuid, incident.uuid);
        assert_eq!(restored.pid, incident.pid);
        assert_eq!(restored.process_name, incident.process_name);
        assert_eq!(restored.state, incident.state);
        assert_eq!(restored.created_at, incident.created_at);
        assert_eq!(restored.updated_at, incident.updated_at);

        assert_eq!(restored.associated_events.len(), 1);
        let event = &restored.associated_events[0];
        assert_eq!(event.kind, EventKind::NetworkConnect);
        assert_eq!(event.timestamp, incident.associated_events[0].timestamp);
        assert_eq!(event.meta("remote_port"), Some("4444"));

        assert_eq!(restored.risk_timeline.len(), 1);
        assert_eq!(restored.risk_timeline[0].score, 60);
        assert_eq!(
            restored.risk_timeline[0].timestamp,
            incident.risk_timeline[0].timestamp
        );

        assert_eq!(restored.containment_actions.len(), 1);
        assert!(restored.containment_actions[0].success);
        assert_eq!(
            restored.containment_actions[0].timestamp,
            incident.containment_actions[0].timestamp
        );

        assert_eq!(restored.state_history.len(), 1);
        assert_eq!(
            restored.state_history[0].timestamp,
            incident.state_history[0].timestamp
        );
    }

    #[test]
    fn test_file_name_format() {
        let incident = Incident::new(1, "a.exe");
        let name = incident.file_name();
        assert!(name.ends_with(".json"));
        assert!(name.contains(&incident.uuid.to_string()));
        // YYYY-MM-DD_ prefix
        assert_eq!(name.as_bytes()[4], b'-');
        assert_eq!(name.as_bytes()[7], b'-');
        assert_eq!(name.as_bytes()[10], b'_');
    }
}
