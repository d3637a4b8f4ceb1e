//! Fleet dispatch service - live bus tracking and dispatch lifecycle
//!
//! Consumes tracker records from the telematics push channel, keeps one
//! reconciled state per tracker, closes road segments at terminal arrival
//! and reports overspeed incidents to the dispatch backend.
//!
//! Module structure:
//! - `domain/` - Core types (VehicleEvent, VehicleState, FleetRoster, zones)
//! - `io/` - External interfaces (MQTT transport, HTTP API, key-value storage)
//! - `services/` - Business logic (Engine, coordinator, detectors, refresh)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use fleet_dispatch::domain::{DispatchStatus, FleetRoster};
use fleet_dispatch::infra::{Config, Metrics};
use fleet_dispatch::io::{start_transport, ApiSet, FileKvStore, HttpApiClient, PersistenceBridge};
use fleet_dispatch::services::refresh::fetch_roster;
use fleet_dispatch::services::trail::TrailAccumulator;
use fleet_dispatch::services::{Engine, VehicleStateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Fleet dispatch service
#[derive(Parser, Debug)]
#[command(name = "fleet-dispatch", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Bounded so a stalled engine pushes back on the transport
const RECORD_CHANNEL_CAPACITY: usize = 1000;

fn init_tracing(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-record visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "fleet-dispatch starting");

    let config = Config::load_from_path(&args.config);
    info!(
        config_file = %config.config_file(),
        api_base_url = %config.api_base_url(),
        transport_host = %config.transport_host(),
        transport_port = %config.transport_port(),
        transport_topic = %config.transport_topic(),
        storage_dir = %config.storage_dir(),
        zones = config.zones().len(),
        overspeed_threshold_kmh = config.overspeed_threshold_kmh(),
        roster_sync_secs = config.roster_sync_secs(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let apis = ApiSet::from_client(Arc::new(HttpApiClient::new(&config)?));

    // Restore the persisted fleet before any record is accepted
    let persistence = Arc::new(PersistenceBridge::new(Arc::new(FileKvStore::new(config.storage_dir()))));
    let trail = TrailAccumulator::new(config.trail_max_points(), config.trail_dedupe_consecutive());
    let store = VehicleStateStore::from_states(persistence.load().await, trail);
    // Engine::new seeds its ended log ids from the bridge

    let roster = match fetch_roster(apis.dispatch.as_ref()).await {
        Ok(roster) => {
            info!(buses = roster.len(), "roster_loaded");
            roster
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "roster_load_failed");
            FleetRoster::default()
        }
    };

    let (mut engine, handle) = Engine::new(
        config.clone(),
        apis,
        store,
        roster,
        Some(persistence.clone()),
        metrics.clone(),
    );

    let writer = persistence.spawn_writer(
        handle.subscribe_vehicles(),
        handle.subscribe_live(),
        config.persistence_debounce(),
        metrics.clone(),
        shutdown_rx.clone(),
    );

    // Start metrics reporter (lock-free reads, vehicle counts from the snapshot)
    let reporter = handle.clone();
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            let vehicles = reporter.vehicles();
            let active =
                vehicles.iter().filter(|v| v.dispatch_status() != DispatchStatus::Idle).count();
            reporter_metrics.report(vehicles.len(), active).log();
        }
    });

    // Overspeed alerts for whoever watches the log
    let mut alerts = handle.subscribe_overspeed();
    tokio::spawn(async move {
        loop {
            match alerts.recv().await {
                Ok(incident) => info!(
                    vehicle_id = %incident.vehicle_id,
                    speed_kmh = incident.speed_kmh,
                    latitude = incident.latitude,
                    longitude = incident.longitude,
                    "overspeed_alert"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "overspeed_alerts_lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Start MQTT transport
    let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    let transport_config = config.clone();
    let transport_metrics = metrics.clone();
    let transport_shutdown = shutdown_rx;
    tokio::spawn(async move {
        if let Err(e) =
            start_transport(&transport_config, record_tx, transport_metrics, transport_shutdown).await
        {
            error!(error = %e, "transport_failed");
        }
    });

    // Run engine - consumes records until the transport closes its channel
    let mut engine_task = tokio::spawn(async move {
        engine.run(record_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown_signal_received"),
        _ = &mut engine_task => warn!("engine_stopped_before_shutdown"),
    }
    let _ = shutdown_tx.send(true);

    if !engine_task.is_finished() {
        if let Err(e) = engine_task.await {
            error!(error = %e, "engine_task_failed");
        }
    }
    if let Err(e) = writer.await {
        error!(error = %e, "persistence_writer_failed");
    }

    info!("fleet-dispatch shutdown complete");
    Ok(())
}
