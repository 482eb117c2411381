//! Tamper-Evident Audit Logger
//!
//! Append-only audit trail where each entry is HMAC-SHA256 chained to its
//! predecessor. The HMAC is computed over the ISO-8601 timestamp text so the
//! chain can be re-verified from the stored rows alone; the first entry links
//! to the literal `"GENESIS"`.

use crate::core::{current_timestamp_ms, Event, EventBus, EventKind, SubscriptionId};
use crate::core::event::timestamp_to_iso8601;
use crate::persistence::store::{Store, StoreError};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::json;
use sha2::Sha256;
use std::path::Path;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Chain origin marker for an empty audit log
pub const GENESIS_HASH: &str = "GENESIS";

#[derive(Debug)]
pub enum AuditError {
    /// `prev_hash` did not link to the previous entry
    ChainBroken { sequence_id: u64 },
    /// Recomputed HMAC differs from the stored `entry_hash`
    HashMismatch { sequence_id: u64 },
    Store(StoreError),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::ChainBroken { sequence_id } => {
                write!(f, "Audit chain broken at sequence_id={}", sequence_id)
            }
            AuditError::HashMismatch { sequence_id } => {
                write!(f, "Audit HMAC mismatch at sequence_id={}", sequence_id)
            }
            AuditError::Store(e) => write!(f, "Audit storage error: {}", e),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<StoreError> for AuditError {
    fn from(e: StoreError) -> Self {
        AuditError::Store(e)
    }
}

struct ChainState {
    tip: String,
    entry_count: u64,
}

struct AuditInner {
    bus: Arc<EventBus>,
    store: Arc<Store>,
    key: Vec<u8>,
    chain: Mutex<ChainState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<AuditInner>,
}

impl AuditLogger {
    /// Bind to a store and secret key, resuming the chain from the most
    /// recent persisted entry.
    pub fn new(bus: Arc<EventBus>, store: Arc<Store>, key: &[u8]) -> Result<Self, StoreError> {
        let mut tip = GENESIS_HASH.to_string();
        let mut entry_count = 0;

        let newest = store.query_audit_entries_raw("", 1, 0, true)?;
        if let Some(row) = newest.first() {
            tip = row.entry_hash.clone();
            entry_count = store.audit_entry_count()?;
        }

        log::info!(
            "AuditLogger initialized (chain_tip={})",
            &tip[..tip.len().min(16)]
        );

        Ok(Self {
            inner: Arc::new(AuditInner {
                bus,
                store,
                key: key.to_vec(),
                chain: Mutex::new(ChainState { tip, entry_count }),
                subscriptions: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Subscribe to auditable event kinds and mark the start of the session.
    pub fn start(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            log::warn!("AuditLogger already running");
            return;
        }

        let kinds = [
            EventKind::RiskThresholdExceeded,
            EventKind::IncidentStateChange,
            EventKind::ContainmentAction,
        ];
        for kind in kinds {
            let logger = self.clone();
            subscriptions.push(
                self.inner
                    .bus
                    .subscribe(kind, move |event| logger.on_event(event)),
            );
        }
        drop(subscriptions);

        if let Err(e) = self.log_action("AUDIT_STARTED", "system", "audit_logger", "Audit logging system started") {
            log::error!("Failed to record AUDIT_STARTED: {}", e);
        }
        log::info!("AuditLogger started");
    }

    pub fn stop(&self) {
        if let Err(e) = self.log_action("AUDIT_STOPPED", "system", "audit_logger", "Audit logging system stopped") {
            log::error!("Failed to record AUDIT_STOPPED: {}", e);
        }

        let mut subscriptions = self.inner.subscriptions.lock();
        for id in subscriptions.drain(..) {
            self.inner.bus.unsubscribe(id);
        }
        log::info!("AuditLogger stopped");
    }

    /// Append one chained entry. The tip only advances when the row insert
    /// succeeds, so a failed write never poisons the chain.
    pub fn log_action(
        &self,
        action: &str,
        actor: &str,
        target: &str,
        details: &str,
    ) -> Result<(), StoreError> {
        let mut chain = self.inner.chain.lock();

        let timestamp = current_timestamp_ms();
        let prev_hash = chain.tip.clone();
        let entry_hash = compute_entry_hash(
            &self.inner.key,
            &timestamp_to_iso8601(timestamp),
            action,
            actor,
            target,
            details,
            &prev_hash,
        );

        self.inner.store.insert_audit_entry(
            timestamp, action, actor, target, details, &prev_hash, &entry_hash,
        )?;

        chain.tip = entry_hash;
        chain.entry_count += 1;

        log::debug!("Audit: action={} actor={} target={}", action, actor, target);
        Ok(())
    }

    /// Walk the whole chain in sequence order, checking linkage and
    /// recomputing every HMAC from the stored text. Returns the number of
    /// verified entries; any failure names the offending sequence id.
    pub fn verify_integrity(&self) -> Result<u64, AuditError> {
        let rows = self.inner.store.query_audit_entries_raw("", 0, 0, false)?;
        if rows.is_empty() {
            log::info!("Audit chain empty; nothing to verify");
            return Ok(0);
        }

        let mut expected_prev = GENESIS_HASH.to_string();
        for row in &rows {
            if row.prev_hash != expected_prev {
                log::error!(
                    "Audit chain broken at sequence_id={} (expected prev_hash={}, got={})",
                    row.sequence_id,
                    &expected_prev[..expected_prev.len().min(16)],
                    &row.prev_hash[..row.prev_hash.len().min(16)]
                );
                return Err(AuditError::ChainBroken {
                    sequence_id: row.sequence_id,
                });
            }

            let computed = compute_entry_hash(
                &self.inner.key,
                &row.timestamp,
                &row.action,
                &row.actor,
                &row.target,
                &row.details,
                &row.prev_hash,
            );
            if computed != row.entry_hash {
                log::error!(
                    "Audit HMAC mismatch at sequence_id={}",
                    row.sequence_id
                );
                return Err(AuditError::HashMismatch {
                    sequence_id: row.sequence_id,
                });
            }

            expected_prev = row.entry_hash.clone();
        }

        log::info!("Audit chain verified ({} entries)", rows.len());
        Ok(rows.len() as u64)
    }

    /// Export entries in a time range (0/0 = everything) as a JSON document
    /// carrying both hashes per entry, for offline re-verification.
    pub fn export<P: AsRef<Path>>(
        &self,
        start_ms: u64,
        end_ms: u64,
        output_path: P,
    ) -> Result<u64, AuditError> {
        let where_clause = if start_ms > 0 && end_ms > 0 {
            format!(
                "timestamp >= '{}' AND timestamp <= '{}'",
                timestamp_to_iso8601(start_ms),
                timestamp_to_iso8601(end_ms)
            )
        } else {
            String::new()
        };

        let rows = self
            .inner
            .store
            .query_audit_entries_raw(&where_clause, 0, 0, false)?;
        let chain_valid = self.verify_integrity().is_ok();

        let entries: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "sequence_id": row.sequence_id,
                    "timestamp": &row.timestamp,
                    "action": &row.action,
                    "actor": &row.actor,
                    "target": &row.target,
                    "details": &row.details,
                    "prev_hash": &row.prev_hash,
                    "entry_hash": &row.entry_hash,
                })
            })
            .collect();

        let document = json!({
            "export_timestamp": timestamp_to_iso8601(current_timestamp_ms()),
            "entry_count": rows.len(),
            "chain_valid": chain_valid,
            "entries": entries,
        });

        let path = output_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
            }
        }
        let pretty = serde_json::to_string_pretty(&document).map_err(StoreError::Serde)?;
        std::fs::write(path, pretty).map_err(StoreError::Io)?;

        log::info!("Exported {} audit entries to {}", rows.len(), path.display());
        Ok(rows.len() as u64)
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.chain.lock().entry_count
    }

    pub fn chain_tip(&self) -> String {
        self.inner.chain.lock().tip.clone()
    }

    fn on_event(&self, event: &Event) {
        let details = serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string());
        let target = if event.process_name.is_empty() {
            format!("PID:{}", event.pid)
        } else {
            event.process_name.clone()
        };
        if let Err(e) = self.log_action(event.kind.as_str(), "system", &target, &details) {
            log::error!("Failed to audit {}: {}", event.kind.as_str(), e);
        }
    }
}

/// Canonical serialisation: fields joined by `|` in fixed order, HMAC'd and
/// hex-encoded.
fn compute_entry_hash(
    key: &[u8],
    timestamp_iso: &str,
    action: &str,
    actor: &str,
    target: &str,
    details: &str,
    prev_hash: &str,
) -> String {
    let data = format!(
        "{}|{}|{}|{}|{}|{}",
        timestamp_iso, action, actor, target, details, prev_hash
    );

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> (AuditLogger, Arc<Store>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let logger = AuditLogger::new(Arc::clone(&bus), Arc::clone(&store), b"test-key-32-bytes-long-exactly!!")
            .unwrap();
        (logger, store, bus)
    }

    #[test]
    fn test_first_entry_links_to_genesis() {
        let (logger, store, _bus) = logger();
        logger.log_action("TEST", "system", "t", "d").unwrap();

        let rows = store.query_audit_entries_raw("", 0, 0, false).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].prev_hash, GENESIS_HASH);
        assert_eq!(rows[0].entry_hash.len(), 64); // SHA-256 hex
    }

    #[test]
    fn test_chain_links_and_verifies() {
        let (logger, store, _bus) = logger();
        for i in 0..5 {
            logger
                .log_action("ACTION", "system", &format!("target{}", i), "details")
                .unwrap();
        }

        let rows = store.query_audit_entries_raw("", 0, 0, false).unwrap();
        for pair in rows.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].entry_hash);
        }

        assert_eq!(logger.verify_integrity().unwrap(), 5);
        assert_eq!(logger.entry_count(), 5);
    }

    #[test]
    fn test_empty_chain_verifies() {
        let (logger, _store, _bus) = logger();
        assert_eq!(logger.verify_integrity().unwrap(), 0);
    }

    #[test]
    fn test_hmac_covers_iso_timestamp_form() {
        let key = b"k";
        let hash = compute_entry_hash(
            key,
            "2024-01-01T00:00:00.000Z",
            "A",
            "system",
            "t",
            "d",
            GENESIS_HASH,
        );
        // Deterministic for fixed inputs
        assert_eq!(
            hash,
            compute_entry_hash(key, "2024-01-01T00:00:00.000Z", "A", "system", "t", "d", GENESIS_HASH)
        );
        // Any field change flips the digest
        assert_ne!(
            hash,
            compute_entry_hash(key, "2024-01-01T00:00:00.001Z", "A", "system", "t", "d", GENESIS_HASH)
        );
    }

    #[test]
    fn test_subscribed_events_become_entries() {
        let (logger, store, bus) = logger();
        logger.start();
        let before = store.audit_entry_count().unwrap(); // AUDIT_STARTED

        bus.publish(
            &Event::new(EventKind::ContainmentAction, 5, "mal.exe")
                .with_meta("action", "process_terminate")
                .with_meta("reason", "high risk"),
        );

        let rows = store.query_audit_entries_raw("", 0, 0, false).unwrap();
        assert_eq!(rows.len() as u64, before + 1);
        let last = rows.last().unwrap();
        assert_eq!(last.action, "CONTAINMENT_ACTION");
        assert_eq!(last.target, "mal.exe");
        let details: serde_json::Value = serde_json::from_str(&last.details).unwrap();
        assert_eq!(details["action"], "process_terminate");

        logger.stop();
        assert!(logger.verify_integrity().is_ok());
    }

    #[test]
    fn test_export_document_shape() {
        let (logger, _store, _bus) = logger();
        logger.log_action("A", "system", "t", "d").unwrap();
        logger.log_action("B", "system", "t", "d").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let count = logger.export(0, 0, &path).unwrap();
        assert_eq!(count, 2);

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["entry_count"], 2);
        assert_eq!(value["chain_valid"], true);
        assert_eq!(value["entries"].as_array().unwrap().len(), 2);
        assert!(value["entries"][0]["entry_hash"].is_string());
        assert!(value["entries"][0]["prev_hash"].is_string());
    }
}
