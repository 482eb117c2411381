//! Per-Process Risk Scorer
//!
//! Additive heuristic scoring keyed by pid. Each observed event contributes
//! zero or more (reason, points) factors; factors are deduped by reason tag
//! and the total saturates at 100. When a process crosses into a higher risk
//! level the scorer publishes a `RiskThresholdExceeded` event on the async
//! path so downstream analysers never block collectors.

use crate::core::{Event, EventBus, EventKind, SubscriptionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Suspicious remote ports watched on outbound connections
const SUSPICIOUS_PORTS: &[u32] = &[4444, 1337, 6667, 31337];

pub const MAX_RISK_SCORE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub fn from_str(s: &str) -> RiskLevel {
        match s {
            "MEDIUM" => RiskLevel::Medium,
            "HIGH" => RiskLevel::High,
            "CRITICAL" => RiskLevel::Critical,
            _ => RiskLevel::Low,
        }
    }
}

/// Risk state for one pid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScore {
    pub score: u32,
    pub level: RiskLevel,
    pub contributing_factors: HashMap<String, u32>,
}

impl Default for RiskScore {
    fn default() -> Self {
        Self {
            score: 0,
            level: RiskLevel::Low,
            contributing_factors: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    low: u32,
    medium: u32,
    high: u32,
    critical: u32,
}

struct ScorerState {
    scores: HashMap<u32, RiskScore>,
    thresholds: Thresholds,
}

struct ScorerInner {
    bus: Arc<EventBus>,
    state: Mutex<ScorerState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// Cheap-to-clone handle; all clones share the same scorer state.
#[derive(Clone)]
pub struct RiskScorer {
    inner: Arc<ScorerInner>,
}

impl RiskScorer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(ScorerInner {
                bus,
                state: Mutex::new(ScorerState {
                    scores: HashMap::new(),
                    thresholds: Thresholds {
                        low: crate::constants::DEFAULT_THRESHOLD_LOW,
                        medium: crate::constants::DEFAULT_THRESHOLD_MEDIUM,
                        high: crate::constants::DEFAULT_THRESHOLD_HIGH,
                        critical: crate::constants::DEFAULT_THRESHOLD_CRITICAL,
                    },
                }),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to every collector event kind.
    pub fn start(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            log::warn!("RiskScorer already running");
            return;
        }

        for kind in EventKind::COLLECTOR_KINDS {
            let scorer = self.clone();
            subscriptions.push(
                self.inner
                    .bus
                    .subscribe(kind, move |event| scorer.process_event(event)),
            );
        }
        log::info!("RiskScorer started");
    }

    pub fn stop(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        for id in subscriptions.drain(..) {
            self.inner.bus.unsubscribe(id);
        }
        log::info!("RiskScorer stopped");
    }

    /// Score one event. Missing metadata means the event simply does not
    /// contribute; heterogeneous collectors are expected.
    pub fn process_event(&self, event: &Event) {
        if event.kind == EventKind::ProcessTerminate {
            self.clear(event.pid);
            return;
        }

        let contributions = score_event(event);
        if contributions.is_empty() {
            return;
        }

        let escalation = {
            let mut state = self.inner.state.lock();
            let before = state
                .scores
                .get(&event.pid)
                .map_or(RiskLevel::Low, |r| r.level);

            for (reason, points) in &contributions {
                add_risk(&mut state, event.pid, reason, *points);
            }

            let after = state.scores.get(&event.pid).map(|r| (r.score, r.level));
            match after {
                Some((score, level)) if level > before => Some((score, level)),
                _ => None,
            }
        };

        // Publish outside the state lock; handlers read the scorer back.
        if let Some((score, level)) = escalation {
            let reasons: Vec<&str> = contributions.iter().map(|(r, _)| *r).collect();
            let derived = Event::new(EventKind::RiskThresholdExceeded, event.pid, &event.process_name)
                .with_meta("risk_score", &score.to_string())
                .with_meta("risk_level", level.as_str())
                .with_meta("reason", &reasons.join(","));
            self.inner.bus.publish_async(derived);
            log::warn!(
                "Risk level for PID {} escalated to {} (score {})",
                event.pid,
                level.as_str(),
                score
            );
        }
    }

    /// Current risk state for a pid (default zero score when never seen).
    pub fn score(&self, pid: u32) -> RiskScore {
        self.inner
            .state
            .lock()
            .scores
            .get(&pid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self, pid: u32) {
        if self.inner.state.lock().scores.remove(&pid).is_some() {
            log::debug!("Cleared risk state for terminated PID {}", pid);
        }
    }

    pub fn tracked_process_count(&self) -> usize {
        self.inner.state.lock().scores.len()
    }

    pub fn set_thresholds(&self, low: u32, medium: u32, high: u32, critical: u32) {
        let mut state = self.inner.state.lock();
        state.thresholds = Thresholds {
            low,
            medium,
            high,
            critical,
        };
        let thresholds = state.thresholds;
        for risk in state.scores.values_mut() {
            risk.level = calculate_level(risk.score, &thresholds);
        }
    }
}

/// The detection surface: exact triggers, points, and reason tags.
fn score_event(event: &Event) -> Vec<(&'static str, u32)> {
    let mut contributions = Vec::new();

    match event.kind {
        EventKind::ProcessCreate => {
            if let Some(path) = event.meta("image_path") {
                let path = path.to_lowercase();
                if path.contains("\\temp\\") || path.contains("\\appdata\\") {
                    contributions.push(("process_from_temp_or_appdata", 15));
                }
            }
        }
        EventKind::FileCreate | EventKind::FileModify => {
            if let Some(path) = event.meta("file_path") {
                let path = path.to_lowercase();
                if path.contains("\\system32\\") || path.contains("\\syswow64\\") {
                    contributions.push(("write_to_system_directory", 15));
                }
            }
        }
        EventKind::NetworkConnect => {
            if let Some(addr) = event.meta("remote_address") {
                let is_private = addr.starts_with("10.")
                    || addr.starts_with("192.168.")
                    || addr.starts_with("172.16.")
                    || addr == "127.0.0.1"
                    || addr == "0.0.0.0";
                if !is_private {
                    contributions.push(("connection_to_external_ip", 10));
                }
            }
            if let Some(port) = event.meta("remote_port").and_then(|p| p.parse::<u32>().ok()) {
                if SUSPICIOUS_PORTS.contains(&port) {
                    contributions.push(("connection_to_suspicious_port", 15));
                }
            }
        }
        EventKind::RegistryWrite => {
            if let Some(key) = event.meta("key_path") {
                let key = key.to_lowercase();
                if key.contains("\\run") || key.contains("\\services") {
                    contributions.push(("registry_persistence_modification", 20));
                }
            }
        }
        _ => {}
    }

    contributions
}

/// Re-adding a reason replaces its previous contribution; the total is
/// recomputed from the factor map and clamped.
fn add_risk(state: &mut ScorerState, pid: u32, reason: &str, points: u32) {
    let thresholds = state.thresholds;
    let risk = state.scores.entry(pid).or_default();
    risk.contributing_factors.insert(reason.to_string(), points);

    let total: u32 = risk.contributing_factors.values().sum();
    risk.score = total.min(MAX_RISK_SCORE);
    risk.level = calculate_level(risk.score, &thresholds);

    log::debug!("PID {} risk updated: {} ({})", pid, risk.score, reason);
}

fn calculate_level(score: u32, thresholds: &Thresholds) -> RiskLevel {
    if score >= thresholds.critical {
        RiskLevel::Critical
    } else if score >= thresholds.high {
        RiskLevel::High
    } else if score >= thresholds.medium {
        RiskLevel::Medium
    } else if score >= thresholds.low {
        RiskLevel::Low
    } else {
        RiskLevel::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> RiskScorer {
        RiskScorer::new(Arc::new(EventBus::new()))
    }

    fn network_event(pid: u32, addr: &str, port: u32) -> Event {
        Event::new(EventKind::NetworkConnect, pid, "net.exe")
            .with_meta("remote_address", addr)
            .with_meta("remote_port", &port.to_string())
    }

    #[test]
    fn test_temp_process_scores_fifteen() {
        let s = scorer();
        let event = Event::new(EventKind::ProcessCreate, 1, "x.exe")
            .with_meta("image_path", "C:\\Users\\u\\AppData\\Local\\Temp\\x.exe");
        s.process_event(&event);

        let risk = s.score(1);
        assert_eq!(risk.score, 15);
        assert_eq!(risk.level, RiskLevel::Low);
        assert_eq!(
            risk.contributing_factors.get("process_from_temp_or_appdata"),
            Some(&15)
        );
    }

    #[test]
    fn test_reason_tags_dedupe() {
        let s = scorer();
        let event = Event::new(EventKind::RegistryWrite, 2, "reg.exe")
            .with_meta("key_path", "HKCU\\Software\\Microsoft\\Windows\\CurrentVersion\\Run");
        s.process_event(&event);
        s.process_event(&event);
        s.process_event(&event);

        let risk = s.score(2);
        assert_eq!(risk.score, 20);
        assert_eq!(risk.contributing_factors.len(), 1);
    }

    #[test]
    fn test_score_saturates_at_100() {
        let s = scorer();
        // Five distinct reasons of 30 points each
        {
            let mut state = s.inner.state.lock();
            for i in 0..5 {
                add_risk(&mut state, 3, &format!("reason_{}", i), 30);
            }
        }
        let risk = s.score(3);
        assert_eq!(risk.score, 100);
        assert_eq!(risk.level, RiskLevel::Critical);
    }

    #[test]
    fn test_private_addresses_do_not_score() {
        let s = scorer();
        for addr in ["10.1.2.3", "192.168.0.9", "172.16.5.5", "127.0.0.1", "0.0.0.0"] {
            s.process_event(&network_event(4, addr, 80));
        }
        assert_eq!(s.score(4).score, 0);
    }

    #[test]
    fn test_external_address_and_suspicious_port() {
        let s = scorer();
        s.process_event(&network_event(5, "8.8.8.8", 4444));

        let risk = s.score(5);
        assert_eq!(risk.score, 25);
        assert_eq!(
            risk.contributing_factors.get("connection_to_external_ip"),
            Some(&10)
        );
        assert_eq!(
            risk.contributing_factors.get("connection_to_suspicious_port"),
            Some(&15)
        );
    }

    #[test]
    fn test_level_thresholds() {
        let s = scorer();
        let state = s.inner.state.lock();
        let t = state.thresholds;
        assert_eq!(calculate_level(0, &t), RiskLevel::Low);
        assert_eq!(calculate_level(59, &t), RiskLevel::Low);
        assert_eq!(calculate_level(60, &t), RiskLevel::Medium);
        assert_eq!(calculate_level(80, &t), RiskLevel::High);
        assert_eq!(calculate_level(100, &t), RiskLevel::Critical);
        drop(state);

        s.set_thresholds(10, 20, 30, 40);
        let state = s.inner.state.lock();
        let t = state.thresholds;
        assert_eq!(calculate_level(25, &t), RiskLevel::Medium);
        assert_eq!(calculate_level(45, &t), RiskLevel::Critical);
    }

    #[test]
    fn test_terminate_clears_pid_state() {
        let s = scorer();
        s.process_event(&network_event(6, "8.8.4.4", 4444));
        assert!(s.score(6).score > 0);

        s.process_event(&Event::new(EventKind::ProcessTerminate, 6, "net.exe"));
        assert_eq!(s.score(6).score, 0);
        assert_eq!(s.tracked_process_count(), 0);
    }

    #[test]
    fn test_escalation_publishes_derived_event() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::RiskThresholdExceeded, move |e| {
            sink.lock().push(e.clone())
        });

        let s = RiskScorer::new(Arc::clone(&bus));
        s.set_thresholds(10, 20, 30, 40);
        s.process_event(&network_event(7, "8.8.8.8", 4444)); // 25 points -> Medium

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].meta("risk_level"), Some("MEDIUM"));
        assert_eq!(seen[0].meta("risk_score"), Some("25"));
    }

    #[test]
    fn test_no_event_when_level_unchanged() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::RiskThresholdExceeded, move |_| *sink.lock() += 1);

        let s = RiskScorer::new(Arc::clone(&bus));
        // 15 points stays Low under default thresholds
        s.process_event(
            &Event::new(EventKind::ProcessCreate, 8, "y.exe")
                .with_meta("image_path", "C:\\Temp\\y.exe"),
        );
        assert_eq!(*seen.lock(), 0);
    }
}
