//! Behavior Correlator
//!
//! Keeps a short per-process timeline of recent events and scans it for
//! temporal attack patterns (dropper, persistence, lateral movement).
//!
//! The scan phase is O(n²) in the timeline length, so it always runs on a
//! snapshot taken out of the locked region; publishers are never starved by
//! pattern matching.

use crate::core::{Event, EventBus, EventKind, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Timeline retention window
const TIMELINE_WINDOW_SECS: u64 = 60;
/// Dropper: FileCreate (temp/appdata) -> ProcessCreate -> NetworkConnect
const DROPPER_WINDOW_SECS: u64 = 30;
/// Persistence: RegistryWrite (autorun key) -> ProcessCreate
const PERSISTENCE_WINDOW_SECS: u64 = 60;
/// Lateral movement: >=3 SMB/RPC connects to distinct hosts
const LATERAL_WINDOW_SECS: u64 = 10;
const LATERAL_PORTS: &[u32] = &[445, 135, 139];
const LATERAL_MIN_HOSTS: usize = 3;

const DROPPER_BONUS: u32 = 20;
const PERSISTENCE_BONUS: u32 = 20;
const LATERAL_BONUS: u32 = 25;

/// Bounded chronological record of one process's recent events
#[derive(Debug, Clone)]
pub struct ProcessTimeline {
    pub pid: u32,
    pub events: VecDeque<Event>,
    pub last_cleanup: u64,
}

impl ProcessTimeline {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            events: VecDeque::new(),
            last_cleanup: 0,
        }
    }
}

struct CorrelatorInner {
    bus: Arc<EventBus>,
    timelines: RwLock<HashMap<u32, ProcessTimeline>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

#[derive(Clone)]
pub struct BehaviorCorrelator {
    inner: Arc<CorrelatorInner>,
}

impl BehaviorCorrelator {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                bus,
                timelines: RwLock::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn start(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            log::warn!("BehaviorCorrelator already running");
            return;
        }

        let kinds = [
            EventKind::ProcessCreate,
            EventKind::ProcessTerminate,
            EventKind::FileCreate,
            EventKind::FileModify,
            EventKind::NetworkConnect,
            EventKind::RegistryWrite,
        ];
        for kind in kinds {
            let correlator = self.clone();
            subscriptions.push(
                self.inner
                    .bus
                    .subscribe(kind, move |event| correlator.on_event(event)),
            );
        }
        log::info!("BehaviorCorrelator started");
    }

    pub fn stop(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        for id in subscriptions.drain(..) {
            self.inner.bus.unsubscribe(id);
        }
        log::info!("BehaviorCorrelator stopped");
    }

    pub fn timeline_count(&self) -> usize {
        self.inner.timelines.read().len()
    }

    pub fn on_event(&self, event: &Event) {
        let snapshot: Vec<Event>;
        let process_name: String;

        {
            let mut timelines = self.inner.timelines.write();

            if event.kind == EventKind::ProcessTerminate {
                if timelines.remove(&event.pid).is_some() {
                    log::debug!("Removed timeline for terminated process {}", event.pid);
                }
                return;
            }

            if event.pid == 0 {
                return;
            }

            let timeline = timelines
                .entry(event.pid)
                .or_insert_with(|| ProcessTimeline::new(event.pid));
            timeline.events.push_back(event.clone());

            let now = event.timestamp.max(crate::core::current_timestamp_ms());
            cleanup_old_events(timeline, now);

            // Snapshot for pattern detection outside the lock
            snapshot = timeline.events.iter().cloned().collect();
            process_name = event.process_name.clone();
        }

        if scan_dropper(&snapshot) {
            self.emit_pattern(
                event.pid,
                &process_name,
                "Dropper",
                "File creation in suspicious location followed by process spawn and network connection",
                DROPPER_BONUS,
            );
        }
        if scan_persistence(&snapshot) {
            self.emit_pattern(
                event.pid,
                &process_name,
                "Persistence",
                "Registry persistence key modification followed by process creation",
                PERSISTENCE_BONUS,
            );
        }
        if scan_lateral_movement(&snapshot) {
            self.emit_pattern(
                event.pid,
                &process_name,
                "Lateral_Movement",
                "Multiple SMB/RPC connections to different hosts in short time window",
                LATERAL_BONUS,
            );
        }
    }

    fn emit_pattern(
        &self,
        pid: u32,
        process_name: &str,
        pattern_name: &str,
        description: &str,
        bonus_score: u32,
    ) {
        let event = Event::new(EventKind::IncidentStateChange, pid, process_name)
            .with_meta("pattern_name", pattern_name)
            .with_meta("description", description)
            .with_meta("bonus_score", &bonus_score.to_string())
            .with_meta("state", "ACTIVE");
        self.inner.bus.publish_async(event);
        log::warn!("Pattern '{}' detected for PID {}", pattern_name, pid);
    }
}

fn cleanup_old_events(timeline: &mut ProcessTimeline, now: u64) {
    let cutoff = now.saturating_sub(TIMELINE_WINDOW_SECS * 1000);
    while let Some(front) = timeline.events.front() {
        if front.timestamp < cutoff {
            timeline.events.pop_front();
        } else {
            break;
        }
    }
    timeline.last_cleanup = now;
}

/// FileCreate under temp/appdata, then ProcessCreate, then NetworkConnect,
/// all within the dropper window of the file event.
fn scan_dropper(events: &[Event]) -> bool {
    if events.len() < 3 {
        return false;
    }
    let window_ms = DROPPER_WINDOW_SECS * 1000;

    for (i, first) in events.iter().enumerate() {
        if first.kind != EventKind::FileCreate {
            continue;
        }
        let Some(path) = first.meta("file_path") else {
            continue;
        };
        let path = path.to_lowercase();
        if !path.contains("\\temp\\") && !path.contains("\\appdata\\") {
            continue;
        }

        for (j, second) in events.iter().enumerate().skip(i + 1) {
            if second.timestamp > first.timestamp + window_ms {
                break;
            }
            if second.kind != EventKind::ProcessCreate {
                continue;
            }
            for third in events.iter().skip(j + 1) {
                if third.timestamp > first.timestamp + window_ms {
                    break;
                }
                if third.kind == EventKind::NetworkConnect {
                    return true;
                }
            }
        }
    }
    false
}

/// RegistryWrite to an autorun key, then ProcessCreate within the window.
fn scan_persistence(events: &[Event]) -> bool {
    if events.len() < 2 {
        return false;
    }
    let window_ms = PERSISTENCE_WINDOW_SECS * 1000;

    for (i, first) in events.iter().enumerate() {
        if first.kind != EventKind::RegistryWrite {
            continue;
        }
        let Some(key_path) = first.meta("key_path") else {
            continue;
        };
        let key_path = key_path.to_lowercase();
        if !key_path.contains("\\run")
            && !key_path.contains("\\runonce")
            && !key_path.contains("\\services")
        {
            continue;
        }

        for second in events.iter().skip(i + 1) {
            if second.timestamp > first.timestamp + window_ms {
                break;
            }
            if second.kind == EventKind::ProcessCreate {
                return true;
            }
        }
    }
    false
}

/// Three or more SMB/RPC connects to three distinct remote addresses within
/// any window of the lateral-movement length.
fn scan_lateral_movement(events: &[Event]) -> bool {
    let window_ms = LATERAL_WINDOW_SECS * 1000;

    let connections: Vec<(u64, &str)> = events
        .iter()
        .filter(|event| event.kind == EventKind::NetworkConnect)
        .filter_map(|event| {
            let port: u32 = event.meta("remote_port")?.parse().ok()?;
            if LATERAL_PORTS.contains(&port) {
                Some((event.timestamp, event.meta("remote_address")?))
            } else {
                None
            }
        })
        .collect();

    if connections.len() < LATERAL_MIN_HOSTS {
        return false;
    }

    for i in 0..connections.len() - (LATERAL_MIN_HOSTS - 1) {
        let start = connections[i].0;
        let mut unique_hosts = HashSet::new();
        for &(timestamp, address) in &connections[i..] {
            if timestamp > start + window_ms {
                break;
            }
            unique_hosts.insert(address);
            if unique_hosts.len() >= LATERAL_MIN_HOSTS {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(kind: EventKind, pid: u32, ts: u64) -> Event {
        let mut event = Event::new(kind, pid, "test.exe");
        event.timestamp = ts;
        event
    }

    fn dropper_file(pid: u32, ts: u64) -> Event {
        event_at(EventKind::FileCreate, pid, ts)
            .with_meta("file_path", "C:\\Users\\u\\AppData\\Local\\Temp\\x.exe")
    }

    fn smb_connect(pid: u32, ts: u64, addr: &str, port: u32) -> Event {
        event_at(EventKind::NetworkConnect, pid, ts)
            .with_meta("remote_address", addr)
            .with_meta("remote_port", &port.to_string())
    }

    #[test]
    fn test_dropper_detected_within_window() {
        let events = vec![
            dropper_file(7, 1_000),
            event_at(EventKind::ProcessCreate, 7, 2_000),
            event_at(EventKind::NetworkConnect, 7, 3_000),
        ];
        assert!(scan_dropper(&events));
    }

    #[test]
    fn test_dropper_window_boundary() {
        // Exactly 30.000s apart: still inside the window
        let at_boundary = vec![
            dropper_file(7, 0),
            event_at(EventKind::ProcessCreate, 7, 15_000),
            event_at(EventKind::NetworkConnect, 7, 30_000),
        ];
        assert!(scan_dropper(&at_boundary));

        // 30.001s: outside
        let past_boundary = vec![
            dropper_file(7, 0),
            event_at(EventKind::ProcessCreate, 7, 15_000),
            event_at(EventKind::NetworkConnect, 7, 30_001),
        ];
        assert!(!scan_dropper(&past_boundary));
    }

    #[test]
    fn test_dropper_requires_suspicious_path() {
        let events = vec![
            event_at(EventKind::FileCreate, 7, 1_000).with_meta("file_path", "C:\\Work\\x.exe"),
            event_at(EventKind::ProcessCreate, 7, 2_000),
            event_at(EventKind::NetworkConnect, 7, 3_000),
        ];
        assert!(!scan_dropper(&events));
    }

    #[test]
    fn test_dropper_requires_order() {
        let events = vec![
            event_at(EventKind::NetworkConnect, 7, 1_000),
            event_at(EventKind::ProcessCreate, 7, 2_000),
            dropper_file(7, 3_000),
        ];
        assert!(!scan_dropper(&events));
    }

    #[test]
    fn test_persistence_detected() {
        let events = vec![
            event_at(EventKind::RegistryWrite, 8, 1_000)
                .with_meta("key_path", "HKCU\\Software\\Microsoft\\Windows\\CurrentVersion\\RunOnce"),
            event_at(EventKind::ProcessCreate, 8, 50_000),
        ];
        assert!(scan_persistence(&events));
    }

    #[test]
    fn test_persistence_window_exceeded() {
        let events = vec![
            event_at(EventKind::RegistryWrite, 8, 0).with_meta("key_path", "HKLM\\System\\Services\\x"),
            event_at(EventKind::ProcessCreate, 8, 60_001),
        ];
        assert!(!scan_persistence(&events));
    }

    #[test]
    fn test_lateral_movement_needs_distinct_hosts() {
        // Five connects to the same host: no detection
        let same_host: Vec<Event> = (0..5)
            .map(|i| smb_connect(9, 1_000 + i * 200, "10.0.0.1", 445))
            .collect();
        assert!(!scan_lateral_movement(&same_host));

        // Third distinct host triggers
        let mut events = same_host;
        events.push(smb_connect(9, 2_200, "10.0.0.2", 445));
        events.push(smb_connect(9, 2_400, "10.0.0.3", 445));
        assert!(scan_lateral_movement(&events));
    }

    #[test]
    fn test_lateral_movement_ignores_other_ports() {
        let events = vec![
            smb_connect(9, 1_000, "10.0.0.1", 8080),
            smb_connect(9, 1_100, "10.0.0.2", 8080),
            smb_connect(9, 1_200, "10.0.0.3", 8080),
        ];
        assert!(!scan_lateral_movement(&events));
    }

    #[test]
    fn test_lateral_movement_window() {
        let events = vec![
            smb_connect(9, 0, "10.0.0.1", 445),
            smb_connect(9, 11_000, "10.0.0.2", 139),
            smb_connect(9, 22_000, "10.0.0.3", 135),
        ];
        assert!(!scan_lateral_movement(&events));
    }

    #[test]
    fn test_terminate_drops_timeline() {
        let bus = Arc::new(EventBus::new());
        let correlator = BehaviorCorrelator::new(bus);

        correlator.on_event(&Event::new(EventKind::ProcessCreate, 5, "a.exe"));
        assert_eq!(correlator.timeline_count(), 1);

        correlator.on_event(&Event::new(EventKind::ProcessTerminate, 5, "a.exe"));
        assert_eq!(correlator.timeline_count(), 0);
    }

    #[test]
    fn test_timeline_gc_drops_stale_events() {
        let mut timeline = ProcessTimeline::new(1);
        for ts in [0u64, 1_000, 2_000] {
            timeline.events.push_back(event_at(EventKind::FileModify, 1, ts));
        }
        timeline
            .events
            .push_back(event_at(EventKind::FileModify, 1, 70_000));

        cleanup_old_events(&mut timeline, 70_000);
        assert_eq!(timeline.events.len(), 1);
        assert_eq!(timeline.events[0].timestamp, 70_000);
    }

    #[test]
    fn test_pattern_emission_end_to_end() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::IncidentStateChange, move |e| {
            sink.lock().push(e.clone())
        });

        let correlator = BehaviorCorrelator::new(Arc::clone(&bus));
        correlator.on_event(&dropper_file(7, crate::core::current_timestamp_ms()));
        correlator.on_event(&Event::new(EventKind::ProcessCreate, 7, "x.exe"));
        correlator.on_event(&Event::new(EventKind::NetworkConnect, 7, "x.exe"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].meta("pattern_name"), Some("Dropper"));
        assert_eq!(seen[0].meta("bonus_score"), Some("20"));
        assert_eq!(seen[0].meta("state"), Some("ACTIVE"));
        assert_eq!(seen[0].pid, 7);
    }

    #[test]
    fn test_zero_pid_events_not_tracked() {
        let bus = Arc::new(EventBus::new());
        let correlator = BehaviorCorrelator::new(bus);
        correlator.on_event(&Event::new(EventKind::FileModify, 0, "system"));
        assert_eq!(correlator.timeline_count(), 0);
    }
}
