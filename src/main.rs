//! HostShield Agent - Main Entry Point
//!
//! Wires the detection pipeline together and runs the supervising loop:
//! subsystem startup, periodic status refresh, cooperative shutdown.

use hostshield::compliance::AuditLogger;
use hostshield::constants;
use hostshield::core::{EventBus, EventKind};
use hostshield::engine::{BehaviorCorrelator, RiskScorer, RuleEngine};
use hostshield::persistence::Store;
use hostshield::response::IncidentManager;
use hostshield::status::{SharedStatus, StatusWriter};
use hostshield::telemetry::TelemetryExporter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("==========================================================");
    log::info!("  {} v{} - Endpoint Detection & Response", constants::APP_NAME, constants::ENGINE_VERSION);
    log::info!("==========================================================");

    if let Err(code) = run() {
        std::process::exit(code);
    }
}

fn run() -> Result<(), i32> {
    let bus = Arc::new(EventBus::new());
    bus.init_async_pool(constants::DEFAULT_ASYNC_POOL_SIZE);

    let store = match Store::open(constants::get_db_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("Failed to initialize storage: {}", e);
            return Err(1);
        }
    };

    let scorer = RiskScorer::new(Arc::clone(&bus));

    let rule_engine = RuleEngine::new(Arc::clone(&bus));
    let rules_path = constants::get_rules_path();
    match rule_engine.load_rules(&rules_path) {
        Ok(count) => log::info!("Rule engine ready with {} rules", count),
        Err(e) => log::warn!(
            "Could not load rules from {} ({}); continuing with empty rule set",
            rules_path.display(),
            e
        ),
    }

    let correlator = BehaviorCorrelator::new(Arc::clone(&bus));

    let incident_manager = IncidentManager::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        scorer.clone(),
        constants::get_incidents_dir(),
    );

    let audit_logger = match AuditLogger::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        &constants::get_audit_key(),
    ) {
        Ok(logger) => logger,
        Err(e) => {
            log::error!("Failed to initialize audit logger: {}", e);
            return Err(1);
        }
    };

    let telemetry = match TelemetryExporter::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        scorer.clone(),
        constants::get_stream_dir(),
    ) {
        Ok(exporter) => Some(exporter),
        Err(e) => {
            log::warn!("Telemetry stream unavailable ({}); events will not be exported", e);
            None
        }
    };

    let mut status_writer = match StatusWriter::create(constants::get_status_path()) {
        Ok(writer) => Some(writer),
        Err(e) => {
            log::warn!("Status snapshot unavailable ({})", e);
            None
        }
    };

    // Startup order: analysers before the audit trail so the AUDIT_STARTED
    // marker is the first derived entry of the session.
    scorer.start();
    rule_engine.start();
    correlator.start();
    incident_manager.start();
    audit_logger.start();
    if let Some(exporter) = &telemetry {
        exporter.start();
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running_flag.store(false, Ordering::SeqCst);
    }) {
        log::warn!("Could not install signal handler: {}", e);
    }

    log::info!("{} is running. Press Ctrl+C to stop.", constants::APP_NAME);

    let started = Instant::now();
    let refresh = Duration::from_secs(constants::get_status_refresh_secs());

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(refresh);

        let snapshot = match store.status_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Status aggregation failed: {}", e);
                continue;
            }
        };

        if let Some(writer) = &mut status_writer {
            let status = SharedStatus {
                protection_active: true,
                active_incident_count: snapshot.active_incident_count as u32,
                total_incident_count: snapshot.total_incident_count as u32,
                total_event_count: snapshot.total_event_count as u32,
                highest_risk_score: snapshot.highest_risk_score,
                engine_uptime_ms: started.elapsed().as_millis() as u64,
                last_updated_ms: hostshield::core::current_timestamp_ms(),
                process_monitor_active: bus.subscriber_count(EventKind::ProcessCreate) > 0,
                file_monitor_active: bus.subscriber_count(EventKind::FileCreate) > 0,
                network_monitor_active: bus.subscriber_count(EventKind::NetworkConnect) > 0,
                registry_monitor_active: bus.subscriber_count(EventKind::RegistryWrite) > 0,
                engine_version: constants::ENGINE_VERSION.to_string(),
            };
            if let Err(e) = writer.update(&status) {
                log::error!("Status snapshot write failed: {}", e);
            }
        }
    }

    log::info!("Stopping {}...", constants::APP_NAME);

    // Collectors have stopped publishing by now; unsubscribe analysers,
    // drain the async pool, close the audit session, store last.
    if let Some(exporter) = &telemetry {
        exporter.stop();
    }
    correlator.stop();
    rule_engine.stop();
    scorer.stop();
    incident_manager.stop();
    bus.shutdown_async_pool();
    audit_logger.stop();

    log::info!("{} shutdown complete", constants::APP_NAME);
    Ok(())
}
