//! Declarative Rule Engine
//!
//! Loads hash/path/network/registry rules from YAML and matches them against
//! incoming events with `*`/`?` wildcards. Matches are published as
//! `RiskThresholdExceeded` events on the async path so collectors are never
//! blocked by downstream handlers.

use crate::core::{Event, EventBus, EventKind, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Hash,
    Path,
    Network,
    Registry,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Hash => "hash",
            RuleKind::Path => "path",
            RuleKind::Network => "network",
            RuleKind::Registry => "registry",
        }
    }

    pub fn from_str(s: &str) -> Option<RuleKind> {
        match s {
            "hash" => Some(RuleKind::Hash),
            "path" => Some(RuleKind::Path),
            "network" => Some(RuleKind::Network),
            "registry" => Some(RuleKind::Registry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Log,
    Alert,
    Escalate,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Log => "log",
            RuleAction::Alert => "alert",
            RuleAction::Escalate => "escalate",
        }
    }

    pub fn from_str(s: &str) -> RuleAction {
        match s {
            "alert" => RuleAction::Alert,
            "escalate" => RuleAction::Escalate,
            _ => RuleAction::Log,
        }
    }
}

/// A validated detection rule, immutable after load.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub kind: RuleKind,
    pub patterns: Vec<String>,
    pub risk_points: u32,
    pub action: RuleAction,
}

/// Raw YAML shape before validation
#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    name: Option<String>,
    enabled: Option<bool>,
    #[serde(rename = "type")]
    kind: Option<String>,
    patterns: Option<Vec<String>>,
    risk_points: Option<u32>,
    action: Option<String>,
}

#[derive(Debug)]
pub enum RuleLoadError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for RuleLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleLoadError::Io(e) => write!(f, "Failed to read rules file: {}", e),
            RuleLoadError::Yaml(e) => write!(f, "Failed to parse rules file: {}", e),
        }
    }
}

impl std::error::Error for RuleLoadError {}

struct RuleEngineInner {
    bus: Arc<EventBus>,
    rules: RwLock<Vec<Rule>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

#[derive(Clone)]
pub struct RuleEngine {
    inner: Arc<RuleEngineInner>,
}

impl RuleEngine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(RuleEngineInner {
                bus,
                rules: RwLock::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Load rules from a YAML file, replacing the active set atomically.
    /// Invalid individual rules are skipped with a warning; returns the
    /// number of rules loaded.
    pub fn load_rules<P: AsRef<Path>>(&self, path: P) -> Result<usize, RuleLoadError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(RuleLoadError::Io)?;
        let file: RuleFile = serde_yaml::from_str(&contents).map_err(RuleLoadError::Yaml)?;

        let mut rules = Vec::new();
        for raw in file.rules {
            match validate_rule(raw) {
                Ok(rule) => {
                    log::debug!(
                        "Loaded rule: {} (type={}, patterns={}, points={})",
                        rule.name,
                        rule.kind.as_str(),
                        rule.patterns.len(),
                        rule.risk_points
                    );
                    rules.push(rule);
                }
                Err(reason) => log::warn!("Skipping rule: {}", reason),
            }
        }

        let count = rules.len();
        *self.inner.rules.write() = rules;
        log::info!(
            "Loaded {} rules from {}",
            count,
            path.as_ref().display()
        );
        Ok(count)
    }

    /// Subscribe to the event kinds any rule kind can apply to.
    pub fn start(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            log::warn!("RuleEngine already running");
            return;
        }

        let kinds = [
            EventKind::ProcessCreate,
            EventKind::FileCreate,
            EventKind::FileModify,
            EventKind::NetworkConnect,
            EventKind::RegistryWrite,
        ];
        for kind in kinds {
            let engine = self.clone();
            subscriptions.push(
                self.inner
                    .bus
                    .subscribe(kind, move |event| engine.on_event(event)),
            );
        }
        log::info!("RuleEngine started");
    }

    pub fn stop(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        for id in subscriptions.drain(..) {
            self.inner.bus.unsubscribe(id);
        }
        log::info!("RuleEngine stopped");
    }

    pub fn rule_count(&self) -> usize {
        self.inner.rules.read().len()
    }

    pub fn on_event(&self, event: &Event) {
        let matches: Vec<Rule> = {
            let rules = self.inner.rules.read();
            rules
                .iter()
                .filter(|rule| rule.enabled && rule_matches(rule, event))
                .cloned()
                .collect()
        };

        for rule in matches {
            log::info!(
                "Rule matched: '{}' for PID {} ({} points)",
                rule.name,
                event.pid,
                rule.risk_points
            );

            let mut derived =
                Event::new(EventKind::RiskThresholdExceeded, event.pid, &event.process_name)
                    .with_meta("rule_name", &rule.name)
                    .with_meta("rule_type", rule.kind.as_str())
                    .with_meta("risk_points", &rule.risk_points.to_string())
                    .with_meta("action", rule.action.as_str());
            for (key, value) in &event.metadata {
                derived
                    .metadata
                    .insert(format!("original_{}", key), value.clone());
            }
            self.inner.bus.publish_async(derived);
        }
    }
}

fn validate_rule(raw: RawRule) -> Result<Rule, String> {
    let name = match raw.name {
        Some(name) if !name.is_empty() => name,
        _ => return Err("rule without name".to_string()),
    };
    let kind_str = raw
        .kind
        .ok_or_else(|| format!("rule '{}' without type", name))?;
    let kind = RuleKind::from_str(&kind_str)
        .ok_or_else(|| format!("rule '{}' has unknown type '{}'", name, kind_str))?;
    let patterns = match raw.patterns {
        Some(patterns) if !patterns.is_empty() => patterns,
        _ => return Err(format!("rule '{}' without patterns", name)),
    };

    Ok(Rule {
        name,
        enabled: raw.enabled.unwrap_or(true),
        kind,
        patterns,
        risk_points: raw.risk_points.unwrap_or(0),
        action: RuleAction::from_str(raw.action.as_deref().unwrap_or("log")),
    })
}

fn rule_matches(rule: &Rule, event: &Event) -> bool {
    match rule.kind {
        RuleKind::Hash => match_hash_rule(rule, event),
        RuleKind::Path => match_path_rule(rule, event),
        RuleKind::Network => match_network_rule(rule, event),
        RuleKind::Registry => match_registry_rule(rule, event),
    }
}

/// Exact case-insensitive equality against `file_hash`; process creation only.
fn match_hash_rule(rule: &Rule, event: &Event) -> bool {
    if event.kind != EventKind::ProcessCreate {
        return false;
    }
    let Some(hash) = event.meta("file_hash") else {
        return false;
    };
    let hash = hash.to_lowercase();
    rule.patterns.iter().any(|p| p.to_lowercase() == hash)
}

/// Wildcard match on the path key appropriate for the event kind,
/// case-insensitive.
fn match_path_rule(rule: &Rule, event: &Event) -> bool {
    let path = match event.kind {
        EventKind::ProcessCreate => event.meta("image_path"),
        EventKind::FileCreate | EventKind::FileModify => event.meta("file_path"),
        _ => None,
    };
    let Some(path) = path else {
        return false;
    };
    let path = path.to_lowercase();
    rule.patterns
        .iter()
        .any(|p| wildcard_match(&p.to_lowercase(), &path))
}

/// Wildcard match against `remote_address`, case-sensitive.
fn match_network_rule(rule: &Rule, event: &Event) -> bool {
    if event.kind != EventKind::NetworkConnect {
        return false;
    }
    let Some(address) = event.meta("remote_address") else {
        return false;
    };
    rule.patterns.iter().any(|p| wildcard_match(p, address))
}

/// Wildcard match against `key_path`, case-insensitive.
fn match_registry_rule(rule: &Rule, event: &Event) -> bool {
    if event.kind != EventKind::RegistryWrite {
        return false;
    }
    let Some(key_path) = event.meta("key_path") else {
        return false;
    };
    let key_path = key_path.to_lowercase();
    rule.patterns
        .iter()
        .any(|p| wildcard_match(&p.to_lowercase(), &key_path))
}

/// Linear-time backtracking wildcard match: `*` matches any run of
/// characters (including empty), `?` matches exactly one, everything else
/// is literal.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();

    let mut p = 0;
    let mut t = 0;
    let mut star_idx = usize::MAX;
    let mut match_idx = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star_idx = p;
            match_idx = t;
            p += 1;
        } else if star_idx != usize::MAX {
            p = star_idx + 1;
            match_idx += 1;
            t = match_idx;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }

    p == pattern.len()
}
