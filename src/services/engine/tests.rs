//! Tests for the Engine module

use super::*;
use crate::domain::roster::{
    AssignedVehicle, BusAssignment, DispatchLogRecord, VehicleAssignmentRecord,
};
use crate::domain::types::{DispatchStatus, TrackerIdent, VehicleState};
use crate::io::api::{DispatchApi, LocationGateApi, OverspeedApi};
use crate::io::kv::MemoryKvStore;
use crate::io::persistence::SNAPSHOT_KEY;
use crate::services::trail::TrailAccumulator;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};

/// Canitoan terminal
const TERMINAL: (f64, f64) = (8.4663228, 124.5853069);
/// Somewhere on the road between terminals
const ON_ROUTE: (f64, f64) = (8.4712, 124.6001);

/// Scriptable stand-in for every backend API
#[derive(Default)]
struct MockApi {
    next_log_id: AtomicI64,
    failing: Mutex<Vec<&'static str>>,
    calls: Mutex<Vec<&'static str>>,
    assignments: Mutex<Vec<VehicleAssignmentRecord>>,
    dispatches: Mutex<Vec<DispatchLogRecord>>,
    overspeed: Mutex<Vec<OverspeedIncident>>,
}

impl MockApi {
    fn fail(&self, call: &'static str, fail: bool) {
        let mut failing = self.failing.lock();
        failing.retain(|c| *c != call);
        if fail {
            failing.push(call);
        }
    }

    fn calls(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    fn set_backend(&self, assignments: Vec<VehicleAssignmentRecord>, dispatches: Vec<DispatchLogRecord>) {
        *self.assignments.lock() = assignments;
        *self.dispatches.lock() = dispatches;
    }

    fn check(&self, call: &'static str) -> anyhow::Result<()> {
        self.calls.lock().push(call);
        if self.failing.lock().contains(&call) {
            anyhow::bail!("{call} returned 503");
        }
        Ok(())
    }

    fn issue_log_id(&self) -> DispatchLogId {
        DispatchLogId(100 + self.next_log_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl DispatchApi for MockApi {
    async fn start_alley(&self, _: i64, _: &str) -> anyhow::Result<DispatchLogId> {
        self.check("start_alley")?;
        Ok(self.issue_log_id())
    }

    async fn end_alley(&self, _: DispatchLogId) -> anyhow::Result<()> {
        self.check("end_alley")
    }

    async fn start_dispatch(&self, _: i64, _: &str) -> anyhow::Result<DispatchLogId> {
        self.check("start_dispatch")?;
        Ok(self.issue_log_id())
    }

    async fn end_dispatch(&self, _: DispatchLogId) -> anyhow::Result<()> {
        self.check("end_dispatch")
    }

    async fn get_all_dispatches(&self) -> anyhow::Result<Vec<DispatchLogRecord>> {
        self.check("get_all_dispatches")?;
        Ok(self.dispatches.lock().clone())
    }

    async fn get_vehicle_assignments(&self) -> anyhow::Result<Vec<VehicleAssignmentRecord>> {
        self.check("get_vehicle_assignments")?;
        Ok(self.assignments.lock().clone())
    }
}

#[async_trait]
impl OverspeedApi for MockApi {
    async fn create_overspeed_record(&self, incident: &OverspeedIncident) -> anyhow::Result<()> {
        self.check("create_overspeed_record")?;
        self.overspeed.lock().push(incident.clone());
        Ok(())
    }
}

#[async_trait]
impl LocationGateApi for MockApi {
    async fn reset_blocked_locations(&self) -> anyhow::Result<()> {
        self.check("reset_blocked_locations")
    }
}

/// Test harness that keeps the handle and backends reachable
struct TestEngine {
    engine: Engine,
    handle: EngineHandle,
    api: Arc<MockApi>,
    kv: Arc<MemoryKvStore>,
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;
    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl std::ops::DerefMut for TestEngine {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}

impl TestEngine {
    /// Apply completions until no spawned work is left
    async fn drain(&mut self) {
        while self.engine.pending_tasks > 0 {
            match self.engine.completion_rx.recv().await {
                Some(done) => self.engine.handle_completion(done),
                None => break,
            }
        }
    }

    fn state(&self, ident: &str) -> VehicleState {
        self.engine.store.get(&TrackerIdent::new(ident)).expect("tracker should exist")
    }

    async fn start_alley(&mut self, vehicle_id: &str, route: &str) -> Result<DispatchLogId, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.handle_command(Command::StartAlley {
            vehicle_id: vehicle_id.into(),
            route: route.into(),
            reply,
        });
        self.drain().await;
        rx.await.unwrap()
    }

    async fn confirm(&mut self, vehicle_id: &str, route: &str) -> Result<DispatchLogId, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.handle_command(Command::ConfirmDispatch {
            vehicle_id: vehicle_id.into(),
            route: route.into(),
            reply,
        });
        self.drain().await;
        rx.await.unwrap()
    }
}

fn bus(vehicle_id: &str, assignment: i64, status: DispatchStatus, log: Option<i64>) -> BusAssignment {
    BusAssignment {
        vehicle_id: vehicle_id.to_string(),
        vehicle_assignment_id: assignment,
        status,
        route: String::new(),
        dispatch_log_id: log.map(DispatchLogId),
    }
}

fn assignment(vehicle_id: &str, id: i64) -> VehicleAssignmentRecord {
    VehicleAssignmentRecord {
        vehicle_assignment_id: id,
        vehicle: AssignedVehicle { vehicle_id: vehicle_id.to_string() },
    }
}

fn dispatch_log(id: i64, assignment: i64, status: &str) -> DispatchLogRecord {
    DispatchLogRecord {
        dispatch_logs_id: DispatchLogId(id),
        vehicle_assignment_id: assignment,
        status: status.to_string(),
        route: Some("Canitoan".to_string()),
    }
}

/// A record carrying its own dispatch context, as the platform sends it
fn record_with_dispatch(ident: &str, vehicle_id: &str, at: (f64, f64), log_id: i64, status: &str) -> InboundRecord {
    InboundRecord {
        payload: json!({
            "Ident": ident,
            "vehicle_id": vehicle_id,
            "PositionLatitude": at.0,
            "PositionLongitude": at.1,
            "PositionSpeed": 0.0,
            "dispatch": {"dispatch_logs_id": log_id, "status": status},
        }),
        received_at: Utc::now(),
    }
}

fn create_test_engine(buses: Vec<BusAssignment>) -> TestEngine {
    create_test_engine_with_config(Config::default(), buses)
}

fn create_test_engine_with_config(config: Config, buses: Vec<BusAssignment>) -> TestEngine {
    let api = Arc::new(MockApi::default());
    let kv = Arc::new(MemoryKvStore::new());
    let persistence = Arc::new(PersistenceBridge::new(kv.clone()));
    let store = VehicleStateStore::new(TrailAccumulator::default());
    let (engine, handle) = Engine::new(
        config,
        ApiSet::from_client(api.clone()),
        store,
        FleetRoster::from_buses(buses),
        Some(persistence),
        Arc::new(Metrics::new()),
    );
    TestEngine { engine, handle, api, kv }
}

fn record(ident: &str, vehicle_id: &str, at: (f64, f64), speed: f64) -> InboundRecord {
    InboundRecord {
        payload: json!({
            "Ident": ident,
            "vehicle_id": vehicle_id,
            "PositionLatitude": at.0,
            "PositionLongitude": at.1,
            "PositionSpeed": speed,
        }),
        received_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_record_creates_vehicle() {
    let mut engine = create_test_engine(vec![]);

    engine.process_record(record("T1", "101", ON_ROUTE, 20.0));

    assert_eq!(engine.vehicle_count(), 1);
    let state = engine.state("T1");
    assert_eq!(state.vehicle_id(), "101");
    assert_eq!(state.dispatch_status(), DispatchStatus::Idle);
    assert_eq!(state.trail().len(), 1);
    assert_eq!(engine.metrics.events_total(), 1);
}

#[tokio::test]
async fn test_invalid_record_rejected() {
    let mut engine = create_test_engine(vec![]);

    engine.process_record(InboundRecord { payload: json!({"foo": 1}), received_at: Utc::now() });
    engine.process_record(InboundRecord { payload: json!([1, 2]), received_at: Utc::now() });

    assert_eq!(engine.vehicle_count(), 0);
    assert_eq!(engine.metrics.events_rejected(), 2);
}

#[tokio::test]
async fn test_full_dispatch_lifecycle() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::Idle, None)]);
    engine.process_record(record("T1", "101", ON_ROUTE, 10.0));

    // idle -> on alley
    let alley_log = engine.start_alley("101", "Cogon").await.unwrap();
    assert_eq!(alley_log, DispatchLogId(100));
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::OnAlley);
    assert_eq!(engine.handle.roster().find("101").unwrap().route, "Cogon");

    // on alley -> on road
    let road_log = engine.confirm("101", "Canitoan").await.unwrap();
    assert_eq!(road_log, DispatchLogId(101));
    assert_eq!(engine.api.calls("end_alley"), 1);
    let state = engine.state("T1");
    assert_eq!(state.dispatch_status(), DispatchStatus::OnRoad);
    assert_eq!(state.dispatch_log_id(), Some(road_log));

    // Positions keep the roster context
    engine.process_record(record("T1", "101", (8.4690, 124.5950), 30.0));
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::OnRoad);

    // on road -> idle at the terminal
    engine.process_record(record("T1", "101", TERMINAL, 5.0));
    engine.drain().await;

    let state = engine.state("T1");
    assert_eq!(state.dispatch_status(), DispatchStatus::Idle);
    assert_eq!(state.dispatch_log_id(), None);
    assert!(state.trail().is_empty());
    assert_eq!(engine.api.calls("end_dispatch"), 1);
    assert_eq!(engine.metrics.auto_completions(), 1);
    assert_eq!(engine.handle.roster().find("101").unwrap().status, DispatchStatus::Idle);

    // Further terminal samples do nothing
    engine.process_record(record("T1", "101", TERMINAL, 0.0));
    engine.drain().await;
    assert_eq!(engine.api.calls("end_dispatch"), 1);
}

#[tokio::test]
async fn test_duplicate_zone_match_ends_once() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnRoad, Some(7))]);

    engine.process_record(record("T1", "101", TERMINAL, 4.0));
    engine.process_record(record("T1", "101", TERMINAL, 0.0));
    engine.process_record(record("T1", "101", TERMINAL, 0.0));
    engine.drain().await;

    assert_eq!(engine.api.calls("end_dispatch"), 1);
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::Idle);
}

#[tokio::test]
async fn test_duplicate_arrival_with_record_context_ends_once() {
    // Vehicle is not in the roster; the context comes from the record itself
    let mut engine = create_test_engine(vec![]);

    engine.process_record(record_with_dispatch("T1", "101", TERMINAL, 42, "on road"));
    engine.process_record(record_with_dispatch("T1", "101", TERMINAL, 42, "on road"));
    assert!(engine.coordinator.is_ending(DispatchLogId(42)));
    assert_eq!(engine.pending_tasks, 1);
    engine.drain().await;

    // Redelivered after the segment closed
    engine.process_record(record_with_dispatch("T1", "101", TERMINAL, 42, "on road"));
    engine.drain().await;

    assert_eq!(engine.api.calls("end_dispatch"), 1);
    let state = engine.state("T1");
    assert_eq!(state.dispatch_status(), DispatchStatus::Idle);
    assert_eq!(state.dispatch_log_id(), None);
}

#[tokio::test]
async fn test_ended_log_stays_stale_after_restart() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnRoad, Some(7))]);
    engine.process_record(record("T1", "101", TERMINAL, 0.0));
    engine.drain().await;

    let persistence = engine.persistence.clone().unwrap();
    assert_eq!(persistence.ended_log_ids(), vec![DispatchLogId(7)]);
    persistence.save(&engine.store.all()).await.unwrap();
    assert!(engine.kv.contains(SNAPSHOT_KEY));

    // Fresh process over the same storage, backend not caught up yet
    let restored = Arc::new(PersistenceBridge::new(engine.kv.clone()));
    let store = VehicleStateStore::from_states(restored.load().await, TrailAccumulator::default());
    let api = Arc::new(MockApi::default());
    let (mut restarted, _handle) = Engine::new(
        Config::default(),
        ApiSet::from_client(api.clone()),
        store,
        FleetRoster::from_buses(vec![bus("101", 11, DispatchStatus::OnRoad, Some(7))]),
        Some(restored),
        Arc::new(Metrics::new()),
    );

    restarted.process_record(record_with_dispatch("T1", "101", TERMINAL, 7, "on road"));
    restarted.process_record(record("T1", "101", TERMINAL, 0.0));

    assert_eq!(restarted.roster.find("101").unwrap().status, DispatchStatus::Idle);
    assert_eq!(restarted.pending_tasks, 0);
    assert_eq!(api.calls("end_dispatch"), 0);
    let state = restarted.store.get(&TrackerIdent::new("T1")).unwrap();
    assert_eq!(state.dispatch_status(), DispatchStatus::Idle);
}

#[tokio::test]
async fn test_idle_vehicle_in_zone_is_ignored() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::Idle, None)]);

    engine.process_record(record("T1", "101", TERMINAL, 0.0));
    engine.drain().await;

    assert_eq!(engine.api.calls("end_dispatch"), 0);
    assert_eq!(engine.metrics.auto_completions(), 0);
}

#[tokio::test]
async fn test_end_dispatch_failure_retries() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnRoad, Some(7))]);
    engine.api.fail("end_dispatch", true);

    engine.process_record(record("T1", "101", TERMINAL, 3.0));
    engine.drain().await;
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::OnRoad);
    assert_eq!(engine.metrics.api_failures_total(), 1);

    engine.api.fail("end_dispatch", false);
    engine.process_record(record("T1", "101", TERMINAL, 0.0));
    engine.drain().await;

    assert_eq!(engine.api.calls("end_dispatch"), 2);
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::Idle);
}

#[tokio::test]
async fn test_stale_context_after_completion() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnRoad, Some(7))]);
    engine.process_record(record("T1", "101", TERMINAL, 0.0));
    engine.drain().await;

    // Platform still echoes the closed segment
    engine.process_record(InboundRecord {
        payload: json!({
            "Ident": "T1",
            "vehicle_id": "101",
            "PositionLatitude": ON_ROUTE.0,
            "PositionLongitude": ON_ROUTE.1,
            "dispatch": {"dispatch_logs_id": 7, "status": "on road"},
        }),
        received_at: Utc::now(),
    });
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::Idle);

    // Backend has not caught up either
    engine.apply_roster(FleetRoster::from_buses(vec![bus("101", 11, DispatchStatus::OnRoad, Some(7))]));
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::Idle);
    assert_eq!(engine.roster.find("101").unwrap().status, DispatchStatus::Idle);
}

#[tokio::test]
async fn test_confirm_partial_failure_keeps_alley() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnAlley, Some(7))]);
    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));
    engine.api.fail("start_dispatch", true);

    let result = engine.confirm("101", "Canitoan").await;

    assert!(matches!(result, Err(DispatchError::Api { call: "start_dispatch", .. })));
    assert_eq!(engine.api.calls("end_alley"), 1);
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::OnAlley);
    assert_eq!(engine.roster.find("101").unwrap().dispatch_log_id, Some(DispatchLogId(7)));

    // Vehicle is released for another attempt
    engine.api.fail("start_dispatch", false);
    assert!(engine.confirm("101", "Canitoan").await.is_ok());
}

#[tokio::test]
async fn test_command_validation() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnRoad, Some(7))]);

    assert_eq!(
        engine.start_alley("999", "Cogon").await,
        Err(DispatchError::UnknownVehicle("999".into()))
    );

    engine.process_record(record("T9", "999", ON_ROUTE, 0.0));
    assert_eq!(
        engine.start_alley("999", "Cogon").await,
        Err(DispatchError::NoAssignment("999".into()))
    );

    assert!(matches!(
        engine.start_alley("101", "Cogon").await,
        Err(DispatchError::InvalidState { actual: DispatchStatus::OnRoad, .. })
    ));
    assert_eq!(engine.api.calls("start_alley"), 0);
}

#[tokio::test]
async fn test_start_alley_failure_leaves_idle() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::Idle, None)]);
    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));
    engine.api.fail("start_alley", true);

    assert!(matches!(
        engine.start_alley("101", "Cogon").await,
        Err(DispatchError::Api { call: "start_alley", .. })
    ));
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::Idle);
    assert_eq!(engine.roster_seq, 0);
}

#[tokio::test(start_paused = true)]
async fn test_alley_interval_blocks_confirm() {
    let config = Config::default().with_alley_interval_secs(120);
    let mut engine =
        create_test_engine_with_config(config, vec![bus("101", 11, DispatchStatus::Idle, None)]);
    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));

    engine.start_alley("101", "Cogon").await.unwrap();
    assert!(matches!(
        engine.confirm("101", "Canitoan").await,
        Err(DispatchError::AlleyIntervalRunning { .. })
    ));

    tokio::time::advance(Duration::from_secs(121)).await;
    assert!(engine.confirm("101", "Canitoan").await.is_ok());
}

#[tokio::test]
async fn test_overspeed_broadcast_and_reported() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnRoad, Some(7))]);
    let mut alerts = engine.handle.subscribe_overspeed();

    engine.process_record(record("T1", "101", ON_ROUTE, 50.0));
    assert!(alerts.try_recv().is_err());

    engine.process_record(record("T1", "101", ON_ROUTE, 72.5));
    engine.drain().await;

    let incident = alerts.try_recv().unwrap();
    assert_eq!(incident.vehicle_id, "101");
    assert_eq!(incident.speed_kmh, 72.5);
    assert_eq!(incident.dispatch_log_id, Some(DispatchLogId(7)));
    assert_eq!(engine.api.overspeed.lock().len(), 1);
    assert_eq!(engine.metrics.overspeed_incidents(), 1);
}

#[tokio::test]
async fn test_overspeed_report_failure_is_logged_only() {
    let mut engine = create_test_engine(vec![]);
    engine.api.fail("create_overspeed_record", true);
    let mut alerts = engine.handle.subscribe_overspeed();

    engine.process_record(record("T1", "101", ON_ROUTE, 90.0));
    engine.drain().await;

    let incident = alerts.try_recv().unwrap();
    assert_eq!(incident.dispatch_log_id, None);
    assert_eq!(engine.vehicle_count(), 1);
}

#[tokio::test]
async fn test_tracker_mapping_resolves_vehicle() {
    let config = Config::default().with_tracker_vehicle("T5", "101");
    let mut engine =
        create_test_engine_with_config(config, vec![bus("101", 11, DispatchStatus::OnAlley, Some(3))]);

    engine.process_record(InboundRecord {
        payload: json!({"Ident": "T5", "PositionLatitude": ON_ROUTE.0, "PositionLongitude": ON_ROUTE.1}),
        received_at: Utc::now(),
    });

    let state = engine.state("T5");
    assert_eq!(state.vehicle_id(), "101");
    assert_eq!(state.dispatch_status(), DispatchStatus::OnAlley);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_suspends_and_resumes() {
    let mut engine = create_test_engine(vec![]);
    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));
    engine.api.set_backend(vec![assignment("101", 11)], vec![dispatch_log(55, 11, "on road")]);

    let (reply, rx) = oneshot::channel();
    engine.handle_command(Command::Refresh { reply });
    assert!(!engine.handle.is_live());
    assert!(engine.state("T1").trail().is_empty());

    engine.process_record(record("T1", "101", (8.4720, 124.6010), 0.0));
    assert_eq!(engine.metrics.events_dropped_suspended(), 1);

    engine.drain().await;

    assert!(engine.handle.is_live());
    assert_eq!(rx.await.unwrap(), Ok(RefreshSummary { buses: 1, active_dispatches: 1 }));
    assert_eq!(engine.api.calls("reset_blocked_locations"), 1);

    // Reconciled with the fetched roster
    let state = engine.state("T1");
    assert_eq!(state.dispatch_status(), DispatchStatus::OnRoad);
    assert_eq!(state.dispatch_log_id(), Some(DispatchLogId(55)));
    assert!(state.trail().is_empty());

    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));
    assert_eq!(engine.state("T1").trail().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_share_one_fetch() {
    let mut engine = create_test_engine(vec![]);
    engine.api.set_backend(vec![assignment("101", 11), assignment("102", 12)], vec![]);

    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    engine.handle_command(Command::Refresh { reply: tx1 });
    engine.handle_command(Command::Refresh { reply: tx2 });
    engine.drain().await;

    let expected = Ok(RefreshSummary { buses: 2, active_dispatches: 0 });
    assert_eq!(rx1.await.unwrap(), expected);
    assert_eq!(rx2.await.unwrap(), expected);
    assert_eq!(engine.api.calls("get_vehicle_assignments"), 1);
    assert_eq!(engine.metrics.report(0, 0).refreshes_total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_resumes_immediately() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnAlley, Some(3))]);
    engine.api.fail("get_all_dispatches", true);
    engine.api.fail("reset_blocked_locations", true);

    let (reply, rx) = oneshot::channel();
    engine.handle_command(Command::Refresh { reply });
    engine.drain().await;

    assert!(matches!(rx.await.unwrap(), Err(RefreshError::Fetch(_))));
    assert!(engine.handle.is_live());
    // Previous roster stays
    assert_eq!(engine.roster.find("101").unwrap().status, DispatchStatus::OnAlley);
}

#[tokio::test(start_paused = true)]
async fn test_confirm_during_refresh_survives_refetch() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnAlley, Some(7))]);
    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));
    // Backend still reports the alley when the refresh reads it
    engine.api.set_backend(vec![assignment("101", 11)], vec![dispatch_log(7, 11, "on alley")]);

    let (confirm_tx, confirm_rx) = oneshot::channel();
    engine.handle_command(Command::ConfirmDispatch {
        vehicle_id: "101".into(),
        route: "Canitoan".into(),
        reply: confirm_tx,
    });
    let (refresh_tx, refresh_rx) = oneshot::channel();
    engine.handle_command(Command::Refresh { reply: refresh_tx });
    engine.drain().await;

    assert_eq!(confirm_rx.await.unwrap(), Ok(DispatchLogId(100)));
    assert!(refresh_rx.await.unwrap().is_ok());
    assert!(engine.refresh_journal.is_none());

    let state = engine.state("T1");
    assert_eq!(state.dispatch_status(), DispatchStatus::OnRoad);
    assert_eq!(state.dispatch_log_id(), Some(DispatchLogId(100)));
    let row = engine.roster.find("101").unwrap().clone();
    assert_eq!(row.status, DispatchStatus::OnRoad);
    assert_eq!(row.dispatch_log_id, Some(DispatchLogId(100)));
    assert_eq!(row.route, "Canitoan");

    assert!(matches!(
        engine.start_alley("101", "Cogon").await,
        Err(DispatchError::InvalidState { actual: DispatchStatus::OnRoad, .. })
    ));

    engine.process_record(record("T1", "101", TERMINAL, 0.0));
    engine.drain().await;
    assert_eq!(engine.api.calls("end_dispatch"), 1);
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_without_local_transitions_applies_fetch() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::OnAlley, Some(7))]);
    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));
    engine.api.set_backend(vec![assignment("101", 11)], vec![]);

    let (reply, rx) = oneshot::channel();
    engine.handle_command(Command::Refresh { reply });
    assert_eq!(engine.refresh_journal, Some(Vec::new()));
    engine.drain().await;

    assert_eq!(rx.await.unwrap(), Ok(RefreshSummary { buses: 1, active_dispatches: 0 }));
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::Idle);
    assert_eq!(engine.roster.find("101").unwrap().status, DispatchStatus::Idle);
}

#[tokio::test]
async fn test_background_sync_applies_roster() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::Idle, None)]);
    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));
    engine.api.set_backend(vec![assignment("101", 11)], vec![dispatch_log(9, 11, "on alley")]);

    engine.start_roster_sync();
    engine.start_roster_sync();
    engine.drain().await;

    assert_eq!(engine.api.calls("get_vehicle_assignments"), 1);
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::OnAlley);
    // Background sync does not reset blocked locations
    assert_eq!(engine.api.calls("reset_blocked_locations"), 0);
}

#[tokio::test]
async fn test_background_sync_discarded_after_local_transition() {
    let mut engine = create_test_engine(vec![bus("101", 11, DispatchStatus::Idle, None)]);
    engine.process_record(record("T1", "101", ON_ROUTE, 0.0));
    engine.start_alley("101", "Cogon").await.unwrap();
    assert_eq!(engine.roster_seq, 1);

    // Fetch started before the alley began, so it still shows the bus idle
    engine.sync_in_flight = true;
    engine.pending_tasks += 1;
    engine.handle_completion(Completion::RosterFetched {
        manual: false,
        seq: 0,
        result: Ok(FleetRoster::from_buses(vec![bus("101", 11, DispatchStatus::Idle, None)])),
    });

    assert!(!engine.sync_in_flight);
    assert_eq!(engine.state("T1").dispatch_status(), DispatchStatus::OnAlley);
    assert_eq!(engine.roster.find("101").unwrap().status, DispatchStatus::OnAlley);
}

#[tokio::test]
async fn test_handle_reports_unavailable_engine() {
    let engine = create_test_engine(vec![]);
    let handle = engine.handle.clone();
    drop(engine);

    assert_eq!(handle.start_alley("101", "Cogon").await, Err(DispatchError::EngineUnavailable));
    assert_eq!(handle.refresh().await, Err(RefreshError::EngineUnavailable));
}
