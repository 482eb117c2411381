//! Incident Lifecycle Manager
//!
//! Materialises incidents from derived events, walks them through the
//! lifecycle state machine, and persists every mutation to the store and to
//! a per-incident JSON file.
//!
//! State-change events are buffered during mutation and published only after
//! the incident lock has been released, so subscribers (including this
//! manager's own pattern handler) can never deadlock against it.

use crate::core::{current_timestamp_ms, Event, EventBus, EventKind, SubscriptionId};
use crate::engine::risk_scorer::RiskScorer;
use crate::persistence::store::Store;
use crate::response::incident::{
    ContainmentRecord, Incident, IncidentState, RiskSnapshot, StateTransition,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

struct ManagerState {
    incidents: HashMap<Uuid, Incident>,
    pid_index: HashMap<u32, Uuid>,
}

struct ManagerInner {
    bus: Arc<EventBus>,
    store: Arc<Store>,
    scorer: RiskScorer,
    incidents_dir: PathBuf,
    state: Mutex<ManagerState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

#[derive(Clone)]
pub struct IncidentManager {
    inner: Arc<ManagerInner>,
}

impl IncidentManager {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<Store>,
        scorer: RiskScorer,
        incidents_dir: PathBuf,
    ) -> Self {
        if let Err(e) = std::fs::create_dir_all(&incidents_dir) {
            log::error!(
                "Failed to create incidents directory {}: {}",
                incidents_dir.display(),
                e
            );
        }
        Self {
            inner: Arc::new(ManagerInner {
                bus,
                store,
                scorer,
                incidents_dir,
                state: Mutex::new(ManagerState {
                    incidents: HashMap::new(),
                    pid_index: HashMap::new(),
                }),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn start(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            log::warn!("IncidentManager already running");
            return;
        }

        let manager = self.clone();
        subscriptions.push(self.inner.bus.subscribe(
            EventKind::RiskThresholdExceeded,
            move |event| manager.on_risk_threshold_exceeded(event),
        ));

        let manager = self.clone();
        subscriptions.push(
            self.inner
                .bus
                .subscribe(EventKind::ContainmentAction, move |event| {
                    manager.on_containment_action(event)
                }),
        );

        // Correlator pattern detections arrive as IncidentStateChange events
        // carrying a pattern_name; the manager's own re-broadcasts do not.
        let manager = self.clone();
        subscriptions.push(
            self.inner
                .bus
                .subscribe(EventKind::IncidentStateChange, move |event| {
                    if event.meta("pattern_name").is_some() {
                        manager.on_pattern_detected(event);
                    }
                }),
        );

        log::info!("IncidentManager started");
    }

    pub fn stop(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        for id in subscriptions.drain(..) {
            self.inner.bus.unsubscribe(id);
        }
        log::info!("IncidentManager stopped");
    }

    // --- Query API ---

    pub fn list_incidents(&self) -> Vec<Incident> {
        self.inner.state.lock().incidents.values().cloned().collect()
    }

    pub fn get_incident(&self, uuid: &Uuid) -> Option<Incident> {
        self.inner.state.lock().incidents.get(uuid).cloned()
    }

    pub fn active_incident_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .incidents
            .values()
            .filter(|incident| incident.is_open())
            .count()
    }

    pub fn total_incident_count(&self) -> usize {
        self.inner.state.lock().incidents.len()
    }

    // --- Operator mutation API ---

    pub fn contain_incident(&self, uuid: &Uuid) -> bool {
        self.operator_transition(uuid, IncidentState::Contained, "Manual containment via operator")
    }

    pub fn close_incident(&self, uuid: &Uuid) -> bool {
        self.operator_transition(uuid, IncidentState::Closed, "Manual close via operator")
    }

    pub fn escalate_incident(&self, uuid: &Uuid) -> bool {
        self.operator_transition(uuid, IncidentState::Escalated, "Manual escalation via operator")
    }

    /// Undo containment. No reverse edges exist in the lifecycle, so this
    /// currently always fails; actuator rollback would have to come first.
    pub fn revert_incident(&self, uuid: &Uuid) -> bool {
        let state = self.inner.state.lock();
        match state.incidents.get(uuid) {
            Some(_) => {
                log::warn!("RevertIncident: revert actions not implemented for incident {}", uuid);
                false
            }
            None => {
                log::warn!("RevertIncident: incident {} not found", uuid);
                false
            }
        }
    }

    fn operator_transition(&self, uuid: &Uuid, to: IncidentState, reason: &str) -> bool {
        let (ok, pending, snapshot) = {
            let mut state = self.inner.state.lock();
            let Some(incident) = state.incidents.get_mut(uuid) else {
                log::warn!("Operator transition: incident {} not found", uuid);
                return false;
            };
            let mut pending = Vec::new();
            let ok = transition(incident, to, reason, &mut pending);
            let snapshot = if ok { Some(incident.clone()) } else { None };
            (ok, pending, snapshot)
        };

        self.flush(pending, snapshot);
        ok
    }

    // --- Event handlers ---

    fn on_risk_threshold_exceeded(&self, event: &Event) {
        let (pending, snapshot) = {
            let mut state = self.inner.state.lock();
            let uuid = find_or_create(&mut state, event.pid, &event.process_name);
            let Some(incident) = state.incidents.get_mut(&uuid) else {
                return;
            };

            incident.associated_events.push(event.clone());
            incident.updated_at = current_timestamp_ms();

            if event.pid > 0 {
                let risk = self.inner.scorer.score(event.pid);
                incident.risk_timeline.push(RiskSnapshot {
                    score: risk.score,
                    level: risk.level,
                    timestamp: current_timestamp_ms(),
                });
            }

            let mut pending = Vec::new();
            match event.meta("risk_level") {
                Some("CRITICAL") => {
                    drive_to_active(incident, &mut pending);
                    if incident.state == IncidentState::Active {
                        transition(
                            incident,
                            IncidentState::Escalated,
                            "Risk level reached CRITICAL",
                            &mut pending,
                        );
                    }
                }
                Some("HIGH") => {
                    drive_to_active(incident, &mut pending);
                }
                Some("MEDIUM") => {
                    if incident.state == IncidentState::New {
                        transition(
                            incident,
                            IncidentState::Investigating,
                            "Risk level reached MEDIUM",
                            &mut pending,
                        );
                    }
                }
                _ => {}
            }

            (pending, Some(incident.clone()))
        };

        self.flush(pending, snapshot);
    }

    fn on_pattern_detected(&self, event: &Event) {
        let (pending, snapshot) = {
            let mut state = self.inner.state.lock();
            let uuid = find_or_create(&mut state, event.pid, &event.process_name);
            let Some(incident) = state.incidents.get_mut(&uuid) else {
                return;
            };

            incident.associated_events.push(event.clone());
            incident.updated_at = current_timestamp_ms();

            if event.pid > 0 {
                let risk = self.inner.scorer.score(event.pid);
                incident.risk_timeline.push(RiskSnapshot {
                    score: risk.score,
                    level: risk.level,
                    timestamp: current_timestamp_ms(),
                });
            }

            let pattern = event.meta("pattern_name").unwrap_or("unknown");
            let reason = format!("Behavior pattern detected: {}", pattern);
            let mut pending = Vec::new();
            drive_to_active_with_reason(incident, &reason, &mut pending);

            (pending, Some(incident.clone()))
        };

        self.flush(pending, snapshot);
    }

    fn on_containment_action(&self, event: &Event) {
        let (pending, snapshot) = {
            let mut state = self.inner.state.lock();
            let Some(uuid) = state.pid_index.get(&event.pid).copied() else {
                log::debug!(
                    "ContainmentAction for PID {} has no associated incident",
                    event.pid
                );
                return;
            };
            let Some(incident) = state.incidents.get_mut(&uuid) else {
                return;
            };

            let record = ContainmentRecord {
                action: event.meta("action").unwrap_or("unknown").to_string(),
                success: event
                    .meta("success")
                    .map(|s| s != "false")
                    .unwrap_or(true),
                timestamp: current_timestamp_ms(),
                details: event.meta("reason").unwrap_or("").to_string(),
            };
            let action = record.action.clone();
            incident.containment_actions.push(record);
            incident.updated_at = current_timestamp_ms();

            let mut pending = Vec::new();
            if incident.state == IncidentState::Active || incident.state == IncidentState::Escalated
            {
                transition(
                    incident,
                    IncidentState::Contained,
                    &format!("Containment action: {}", action),
                    &mut pending,
                );
            }

            (pending, Some(incident.clone()))
        };

        self.flush(pending, snapshot);
    }

    // --- Persistence and publication (lock released) ---

    fn flush(&self, pending: Vec<Event>, snapshot: Option<Incident>) {
        for event in pending {
            self.inner.bus.publish_async(event);
        }
        if let Some(incident) = snapshot {
            self.persist(&incident);
        }
    }

    fn persist(&self, incident: &Incident) {
        if let Err(e) = self.inner.store.upsert_incident(incident) {
            log::error!("Failed to persist incident {}: {}", incident.uuid, e);
        }

        let path = self.inner.incidents_dir.join(incident.file_name());
        let json = incident.to_json();
        match serde_json::to_string_pretty(&json) {
            Ok(contents) => {
                if let Err(e) = std::fs::write(&path, contents) {
                    log::error!("Failed to write incident file {}: {}", path.display(), e);
                }
            }
            Err(e) => log::error!("Failed to serialize incident {}: {}", incident.uuid, e),
        }
    }
}

/// Locate the unique open incident for a pid, creating one in `New` if none.
fn find_or_create(state: &mut ManagerState, pid: u32, process_name: &str) -> Uuid {
    if let Some(uuid) = state.pid_index.get(&pid) {
        if let Some(incident) = state.incidents.get(uuid) {
            if incident.is_open() {
                return *uuid;
            }
        }
    }

    let incident = Incident::new(pid, process_name);
    let uuid = incident.uuid;
    state.incidents.insert(uuid, incident);
    state.pid_index.insert(pid, uuid);
    log::info!("Created new incident {} for PID {} ({})", uuid, pid, process_name);
    uuid
}

/// Issue one validated transition, recording history and buffering the
/// state-change event for publication after the lock drops.
fn transition(
    incident: &mut Incident,
    to: IncidentState,
    reason: &str,
    pending: &mut Vec<Event>,
) -> bool {
    if !incident.state.can_transition_to(to) {
        log::warn!(
            "Invalid state transition for incident {}: {} -> {}",
            incident.uuid,
            incident.state.as_str(),
            to.as_str()
        );
        return false;
    }

    let from = incident.state;
    let now = current_timestamp_ms();
    incident.state_history.push(StateTransition {
        from_state: from,
        to_state: to,
        timestamp: now,
        reason: reason.to_string(),
    });
    incident.state = to;
    incident.updated_at = now;

    log::info!(
        "Incident {} state: {} -> {} (reason: {})",
        incident.uuid,
        from.as_str(),
        to.as_str(),
        reason
    );

    pending.push(
        Event::new(EventKind::IncidentStateChange, incident.pid, &incident.process_name)
            .with_meta("incident_uuid", &incident.uuid.to_string())
            .with_meta("from_state", from.as_str())
            .with_meta("to_state", to.as_str())
            .with_meta("reason", reason),
    );
    true
}

/// Minimal legal sequence up to Active.
fn drive_to_active(incident: &mut Incident, pending: &mut Vec<Event>) {
    if incident.state == IncidentState::New {
        transition(
            incident,
            IncidentState::Investigating,
            "Initial risk threshold crossing",
            pending,
        );
    }
    if incident.state == IncidentState::Investigating {
        transition(incident, IncidentState::Active, "Risk level reached HIGH", pending);
    }
}

fn drive_to_active_with_reason(incident: &mut Incident, reason: &str, pending: &mut Vec<Event>) {
    if incident.state == IncidentState::New {
        transition(incident, IncidentState::Investigating, reason, pending);
    }
    if incident.state == IncidentState::Investigating {
        transition(incident, IncidentState::Active, reason, pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (IncidentManager, Arc<EventBus>, tempfile::TempDir) {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scorer = RiskScorer::new(Arc::clone(&bus));
        let dir = tempfile::tempdir().unwrap();
        let manager = IncidentManager::new(
            Arc::clone(&bus),
            store,
            scorer,
            dir.path().to_path_buf(),
        );
        (manager, bus, dir)
    }

    fn risk_event(pid: u32, level: &str) -> Event {
        Event::new(EventKind::RiskThresholdExceeded, pid, "suspect.exe")
            .with_meta("risk_level", level)
            .with_meta("risk_score", "75")
    }

    #[test]
    fn test_medium_creates_investigating_incident() {
        let (manager, _bus, _dir) = manager();
        manager.on_risk_threshold_exceeded(&risk_event(11, "MEDIUM"));

        let incidents = manager.list_incidents();
        assert_eq!(incidents.len(), 1);
        let incident = &incidents[0];
        assert_eq!(incident.state, IncidentState::Investigating);
        assert_eq!(incident.pid, 11);
        assert_eq!(incident.associated_events.len(), 1);
        assert_eq!(incident.risk_timeline.len(), 1);
        assert_eq!(incident.state_history.len(), 1);
    }

    #[test]
    fn test_critical_drives_minimal_legal_sequence() {
        let (manager, _bus, _dir) = manager();
        manager.on_risk_threshold_exceeded(&risk_event(42, "CRITICAL"));

        let incidents = manager.list_incidents();
        assert_eq!(incidents.len(), 1);
        let incident = &incidents[0];
        assert_eq!(incident.state, IncidentState::Escalated);

        let path: Vec<(IncidentState, IncidentState)> = incident
            .state_history
            .iter()
            .map(|t| (t.from_state, t.to_state))
            .collect();
        assert_eq!(
            path,
            vec![
                (IncidentState::New, IncidentState::Investigating),
                (IncidentState::Investigating, IncidentState::Active),
                (IncidentState::Active, IncidentState::Escalated),
            ]
        );
        assert_eq!(incident.state_history.last().unwrap().to_state, incident.state);
    }

    #[test]
    fn test_one_open_incident_per_pid() {
        let (manager, _bus, _dir) = manager();
        manager.on_risk_threshold_exceeded(&risk_event(7, "MEDIUM"));
        manager.on_risk_threshold_exceeded(&risk_event(7, "HIGH"));

        assert_eq!(manager.total_incident_count(), 1);
        let incident = &manager.list_incidents()[0];
        assert_eq!(incident.state, IncidentState::Active);
        assert_eq!(incident.associated_events.len(), 2);

        // Closing allows a fresh incident for the same pid
        let uuid = incident.uuid;
        assert!(manager.close_incident(&uuid));
        manager.on_risk_threshold_exceeded(&risk_event(7, "MEDIUM"));
        assert_eq!(manager.total_incident_count(), 2);
        assert_eq!(manager.active_incident_count(), 1);
    }

    #[test]
    fn test_containment_transitions_active_incident() {
        let (manager, _bus, _dir) = manager();
        manager.on_risk_threshold_exceeded(&risk_event(9, "HIGH"));

        let containment = Event::new(EventKind::ContainmentAction, 9, "suspect.exe")
            .with_meta("action", "process_terminate")
            .with_meta("reason", "operator request");
        manager.on_containment_action(&containment);

        let incident = &manager.list_incidents()[0];
        assert_eq!(incident.state, IncidentState::Contained);
        assert_eq!(incident.containment_actions.len(), 1);
        assert!(incident.containment_actions[0].success);
        assert_eq!(incident.containment_actions[0].action, "process_terminate");
    }

    #[test]
    fn test_containment_failure_recorded_without_transition_from_investigating() {
        let (manager, _bus, _dir) = manager();
        manager.on_risk_threshold_exceeded(&risk_event(12, "MEDIUM"));

        let containment = Event::new(EventKind::ContainmentAction, 12, "suspect.exe")
            .with_meta("action", "network_block")
            .with_meta("success", "false");
        manager.on_containment_action(&containment);

        let incident = &manager.list_incidents()[0];
        assert_eq!(incident.state, IncidentState::Investigating);
        assert_eq!(incident.containment_actions.len(), 1);
        assert!(!incident.containment_actions[0].success);
    }

    #[test]
    fn test_operator_contain_rejected_for_investigating() {
        let (manager, _bus, _dir) = manager();
        manager.on_risk_threshold_exceeded(&risk_event(11, "MEDIUM"));
        let uuid = manager.list_incidents()[0].uuid;

        assert!(!manager.contain_incident(&uuid));
        let incident = manager.get_incident(&uuid).unwrap();
        assert_eq!(incident.state, IncidentState::Investigating);
        assert_eq!(incident.state_history.len(), 1);
    }

    #[test]
    fn test_operator_close_accepted_for_active() {
        let (manager, _bus, _dir) = manager();
        manager.on_risk_threshold_exceeded(&risk_event(13, "HIGH"));
        let uuid = manager.list_incidents()[0].uuid;

        assert!(manager.close_incident(&uuid));
        assert_eq!(
            manager.get_incident(&uuid).unwrap().state,
            IncidentState::Closed
        );
        assert_eq!(manager.active_incident_count(), 0);
    }

    #[test]
    fn test_revert_always_fails() {
        let (manager, _bus, _dir) = manager();
        manager.on_risk_threshold_exceeded(&risk_event(14, "HIGH"));
        let uuid = manager.list_incidents()[0].uuid;

        assert!(!manager.revert_incident(&uuid));
        assert!(!manager.revert_incident(&Uuid::new_v4()));
    }

    #[test]
    fn test_pattern_event_creates_active_incident() {
        let (manager, _bus, _dir) = manager();
        let pattern = Event::new(EventKind::IncidentStateChange, 21, "dropper.exe")
            .with_meta("pattern_name", "Dropper")
            .with_meta("bonus_score", "20")
            .with_meta("state", "ACTIVE");
        manager.on_pattern_detected(&pattern);

        let incident = &manager.list_incidents()[0];
        assert_eq!(incident.state, IncidentState::Active);
        assert_eq!(incident.associated_events.len(), 1);
        assert_eq!(
            incident.associated_events[0].meta("pattern_name"),
            Some("Dropper")
        );
    }

    #[test]
    fn test_state_changes_published_and_files_written() {
        let (manager, bus, dir) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::IncidentStateChange, move |e| {
            sink.lock().push(e.clone())
        });

        manager.on_risk_threshold_exceeded(&risk_event(42, "CRITICAL"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e| e.meta("incident_uuid").is_some()));
        assert_eq!(seen[0].meta("to_state"), Some("INVESTIGATING"));
        assert_eq!(seen[2].meta("to_state"), Some("ESCALATED"));

        let incident = &manager.list_incidents()[0];
        let file = dir.path().join(incident.file_name());
        assert!(file.exists());
        let contents = std::fs::read_to_string(file).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["state"], "ESCALATED");
    }
}
