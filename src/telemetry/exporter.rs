//! Telemetry Exporter
//!
//! Persists every collector event to the store (stamped with the process's
//! current risk score) and mirrors it to an append-only JSONL stream for
//! out-of-process consumers. One JSON object per line, `\n` terminated;
//! `\r\n` is tolerated on read.

use crate::core::event::timestamp_to_iso8601;
use crate::core::{Event, EventBus, EventKind, SubscriptionId};
use crate::engine::risk_scorer::RiskScorer;
use crate::persistence::store::Store;
use chrono::{Datelike, Timelike, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum stream file size before rotation (50 MB)
const MAX_STREAM_SIZE: u64 = 50 * 1024 * 1024;

const STREAM_EXT: &str = ".jsonl";

/// Append-only JSONL writer with size-based rotation
struct StreamWriter {
    writer: BufWriter<File>,
    current_file: PathBuf,
    current_size: u64,
    base_dir: PathBuf,
}

impl StreamWriter {
    fn new(base_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        let (current_file, file) = Self::open_new_file(&base_dir)?;
        Ok(Self {
            writer: BufWriter::new(file),
            current_file,
            current_size: 0,
            base_dir,
        })
    }

    fn open_new_file(base_dir: &Path) -> std::io::Result<(PathBuf, File)> {
        let now = Utc::now();
        let filename = format!(
            "events_{}_{:02}_{:02}_{:02}{:02}{:02}{}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            STREAM_EXT
        );
        let path = base_dir.join(filename);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("Opened event stream: {}", path.display());
        Ok((path, file))
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let bytes = line.as_bytes();
        if self.current_size + bytes.len() as u64 > MAX_STREAM_SIZE {
            self.rotate()?;
        }

        self.writer.write_all(bytes)?;
        self.writer.write_all(b"\n")?;
        self.current_size += bytes.len() as u64 + 1;
        self.writer.flush()
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        let (path, file) = Self::open_new_file(&self.base_dir)?;
        log::info!(
            "Rotated event stream from {} to {}",
            self.current_file.display(),
            path.display()
        );
        self.writer = BufWriter::new(file);
        self.current_file = path;
        self.current_size = 0;
        Ok(())
    }
}

struct ExporterInner {
    bus: Arc<EventBus>,
    store: Arc<Store>,
    scorer: RiskScorer,
    stream: Mutex<StreamWriter>,
    events_exported: AtomicU64,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

#[derive(Clone)]
pub struct TelemetryExporter {
    inner: Arc<ExporterInner>,
}

impl TelemetryExporter {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<Store>,
        scorer: RiskScorer,
        stream_dir: PathBuf,
    ) -> std::io::Result<Self> {
        let stream = StreamWriter::new(stream_dir)?;
        Ok(Self {
            inner: Arc::new(ExporterInner {
                bus,
                store,
                scorer,
                stream: Mutex::new(stream),
                events_exported: AtomicU64::new(0),
                subscriptions: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Subscribe to every collector event kind.
    pub fn start(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.is_empty() {
            log::warn!("TelemetryExporter already running");
            return;
        }

        for kind in EventKind::COLLECTOR_KINDS {
            let exporter = self.clone();
            subscriptions.push(
                self.inner
                    .bus
                    .subscribe(kind, move |event| exporter.on_event(event)),
            );
        }
        log::info!("TelemetryExporter started");
    }

    pub fn stop(&self) {
        let mut subscriptions = self.inner.subscriptions.lock();
        for id in subscriptions.drain(..) {
            self.inner.bus.unsubscribe(id);
        }
        log::info!(
            "TelemetryExporter stopped ({} events exported)",
            self.events_exported()
        );
    }

    pub fn events_exported(&self) -> u64 {
        self.inner.events_exported.load(Ordering::SeqCst)
    }

    pub fn current_stream_file(&self) -> PathBuf {
        self.inner.stream.lock().current_file.clone()
    }

    pub fn on_event(&self, event: &Event) {
        let risk_score = if event.pid > 0 {
            self.inner.scorer.score(event.pid).score
        } else {
            0
        };

        if let Err(e) = self.inner.store.insert_event(event, risk_score) {
            log::error!("Failed to persist event: {}", e);
        }

        let line = json!({
            "timestamp": timestamp_to_iso8601(event.timestamp),
            "event_type": event.kind.as_str(),
            "pid": event.pid,
            "process_name": &event.process_name,
            "risk_score": risk_score,
            "details": &event.metadata,
        })
        .to_string();

        if let Err(e) = self.inner.stream.lock().write_line(&line) {
            log::error!("Failed to write event stream line: {}", e);
        } else {
            self.inner.events_exported.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Read a JSONL stream file back into values, tolerating `\r\n` endings and
/// skipping blank or malformed lines.
pub fn read_stream<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<serde_json::Value>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            events.push(value);
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exporter() -> (TelemetryExporter, Arc<Store>, tempfile::TempDir) {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scorer = RiskScorer::new(Arc::clone(&bus));
        let dir = tempdir().unwrap();
        let exporter = TelemetryExporter::new(
            bus,
            Arc::clone(&store),
            scorer,
            dir.path().to_path_buf(),
        )
        .unwrap();
        (exporter, store, dir)
    }

    #[test]
    fn test_event_persisted_and_streamed() {
        let (exporter, store, _dir) = exporter();

        let event = Event::new(EventKind::ProcessCreate, 321, "calc.exe")
            .with_meta("image_path", "C:\\Windows\\System32\\calc.exe");
        exporter.on_event(&event);

        assert_eq!(store.event_count().unwrap(), 1);
        assert_eq!(exporter.events_exported(), 1);

        let lines = read_stream(exporter.current_stream_file()).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event_type"], "PROCESS_CREATE");
        assert_eq!(lines[0]["pid"], 321);
        assert_eq!(lines[0]["details"]["image_path"], "C:\\Windows\\System32\\calc.exe");
        assert!(lines[0]["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_stream_is_one_json_per_line() {
        let (exporter, _store, _dir) = exporter();
        for i in 0..3 {
            exporter.on_event(&Event::new(EventKind::FileModify, i, "w.exe"));
        }

        let contents = std::fs::read_to_string(exporter.current_stream_file()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
        }
    }

    #[test]
    fn test_read_stream_tolerates_crlf() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crlf.jsonl");
        std::fs::write(&path, "{\"a\":1}\r\n\r\n{\"b\":2}\n").unwrap();

        let values = read_stream(&path).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["a"], 1);
        assert_eq!(values[1]["b"], 2);
    }

    #[test]
    fn test_risk_score_stamped_from_scorer() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scorer = RiskScorer::new(Arc::clone(&bus));
        let dir = tempdir().unwrap();
        let exporter = TelemetryExporter::new(
            bus,
            Arc::clone(&store),
            scorer.clone(),
            dir.path().to_path_buf(),
        )
        .unwrap();

        let event = Event::new(EventKind::RegistryWrite, 66, "reg.exe")
            .with_meta("key_path", "HKLM\\SYSTEM\\CurrentControlSet\\Services\\bad");
        scorer.process_event(&event); // 20 points
        exporter.on_event(&event);

        let lines = read_stream(exporter.current_stream_file()).unwrap();
        assert_eq!(lines[0]["risk_score"], 20);
    }
}
