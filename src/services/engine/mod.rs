//! Vehicle state reconciliation engine
//!
//! The Engine is the single consumer that owns the state table. It
//! coordinates:
//! - Record intake (normalization, state updates, trail growth)
//! - Derived conditions (terminal arrival, overspeed)
//! - Dispatch commands and their API calls
//! - Manual refresh and periodic roster sync
//!
//! External calls never block the loop: they run in spawned tasks that post
//! a `Completion` back to the engine.

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::roster::FleetRoster;
use crate::domain::types::{DispatchContext, DispatchLogId, InboundRecord, OverspeedIncident};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::api::ApiSet;
use crate::io::persistence::PersistenceBridge;
use crate::services::coordinator::{AlleyRequest, ConfirmRequest, DispatchCoordinator, DispatchError};
use crate::services::overspeed::OverspeedDetector;
use crate::services::refresh::{RefreshController, RefreshError, RefreshReply, RefreshSummary};
use crate::services::store::{FleetSnapshot, VehicleStateStore};
use crate::services::zone_detector::ZoneArrivalDetector;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::info;

/// Overspeed alerts kept for slow subscribers before they lag
const INCIDENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

pub(crate) type CommandReply = oneshot::Sender<Result<DispatchLogId, DispatchError>>;

/// Imperative requests from the presentation layer
pub(crate) enum Command {
    StartAlley { vehicle_id: String, route: String, reply: CommandReply },
    ConfirmDispatch { vehicle_id: String, route: String, reply: CommandReply },
    Refresh { reply: RefreshReply },
}

/// Results of spawned work, applied by the engine in arrival order
pub(crate) enum Completion {
    DispatchEnded {
        vehicle_id: String,
        log_id: DispatchLogId,
        result: Result<(), DispatchError>,
    },
    AlleyStarted {
        request: AlleyRequest,
        result: Result<DispatchLogId, DispatchError>,
        reply: CommandReply,
    },
    DispatchConfirmed {
        request: ConfirmRequest,
        result: Result<DispatchLogId, DispatchError>,
        reply: CommandReply,
    },
    RosterFetched {
        manual: bool,
        /// Local transition count when the fetch started
        seq: u64,
        result: Result<FleetRoster, String>,
    },
    RefreshSettled,
    /// Fire-and-forget work (overspeed reports)
    Detached,
}

/// A dispatch transition committed locally while a manual refresh fetch
/// was outstanding; replayed onto the fetched roster
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LocalTransition {
    pub vehicle_id: String,
    pub context: Option<DispatchContext>,
    pub route: Option<String>,
}

/// Central processor for tracker records and dispatch commands
pub struct Engine {
    pub(crate) store: VehicleStateStore,
    pub(crate) zones: ZoneArrivalDetector,
    pub(crate) overspeed: OverspeedDetector,
    pub(crate) coordinator: DispatchCoordinator,
    pub(crate) refresh: RefreshController,
    /// Authoritative bus list, with local transitions applied optimistically
    pub(crate) roster: FleetRoster,
    pub(crate) roster_tx: watch::Sender<Arc<FleetRoster>>,
    /// Bumped on every local dispatch transition; background roster fetches
    /// that started before the latest transition are discarded
    pub(crate) roster_seq: u64,
    pub(crate) sync_in_flight: bool,
    /// `Some` while a manual refresh fetch is outstanding
    pub(crate) refresh_journal: Option<Vec<LocalTransition>>,
    pub(crate) apis: ApiSet,
    pub(crate) persistence: Option<Arc<PersistenceBridge>>,
    pub(crate) incidents: broadcast::Sender<OverspeedIncident>,
    pub(crate) completion_tx: mpsc::UnboundedSender<Completion>,
    pub(crate) completion_rx: mpsc::UnboundedReceiver<Completion>,
    /// Spawned tasks whose completion has not been applied yet
    pub(crate) pending_tasks: usize,
    pub(crate) cmd_rx: mpsc::Receiver<Command>,
    pub(crate) config: Config,
    pub(crate) metrics: Arc<Metrics>,
}

impl Engine {
    /// Create an engine around a (possibly restored) store
    pub fn new(
        config: Config,
        apis: ApiSet,
        mut store: VehicleStateStore,
        mut roster: FleetRoster,
        persistence: Option<Arc<PersistenceBridge>>,
        metrics: Arc<Metrics>,
    ) -> (Self, EngineHandle) {
        let mut coordinator = DispatchCoordinator::new(config.alley_interval());
        if let Some(persistence) = &persistence {
            coordinator.restore_ended(persistence.ended_log_ids());
        }
        handlers::strip_ended_rows(&coordinator, &mut roster);

        let vehicles = store.subscribe();
        let (roster_tx, roster_rx) = watch::channel(Arc::new(roster.clone()));
        let (incidents, _) = broadcast::channel(INCIDENT_CHANNEL_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let refresh = RefreshController::new(config.refresh_settle_delay());

        let handle = EngineHandle {
            cmd_tx,
            vehicles,
            roster: roster_rx,
            incidents: incidents.clone(),
            live: refresh.subscribe_live(),
        };

        let engine = Self {
            store,
            zones: ZoneArrivalDetector::new(config.zones().to_vec(), config.zone_tolerance_deg()),
            overspeed: OverspeedDetector::new(config.overspeed_threshold_kmh()),
            coordinator,
            refresh,
            roster,
            roster_tx,
            roster_seq: 0,
            sync_in_flight: false,
            refresh_journal: None,
            apis,
            persistence,
            incidents,
            completion_tx,
            completion_rx,
            pending_tasks: 0,
            cmd_rx,
            config,
            metrics,
        };

        (engine, handle)
    }

    /// Run until the record channel closes
    pub async fn run(&mut self, mut record_rx: mpsc::Receiver<InboundRecord>) {
        let sync_secs = self.config.roster_sync_secs();
        let sync_enabled = sync_secs > 0;
        let period = Duration::from_secs(sync_secs.max(1));
        let mut sync_interval = interval_at(Instant::now() + period, period);
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(vehicles = self.store.len(), buses = self.roster.len(), "engine_started");

        loop {
            tokio::select! {
                record = record_rx.recv() => {
                    match record {
                        Some(r) => self.process_record(r),
                        None => break, // Channel closed
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd);
                }
                Some(done) = self.completion_rx.recv() => {
                    self.handle_completion(done);
                }
                _ = sync_interval.tick(), if sync_enabled => {
                    self.start_roster_sync();
                }
            }
        }

        info!(pending_tasks = self.pending_tasks, "engine_stopped");
    }

    /// Spawn work whose result comes back as a completion
    pub(crate) fn spawn_task<F>(&mut self, fut: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.pending_tasks += 1;
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
    }

    pub(crate) fn publish_roster(&self) {
        self.roster_tx.send_replace(Arc::new(self.roster.clone()));
    }

    pub fn vehicle_count(&self) -> usize {
        self.store.len()
    }
}

/// Cloneable front for the presentation layer
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<Command>,
    vehicles: watch::Receiver<FleetSnapshot>,
    roster: watch::Receiver<Arc<FleetRoster>>,
    incidents: broadcast::Sender<OverspeedIncident>,
    live: watch::Receiver<bool>,
}

impl EngineHandle {
    /// Latest published fleet snapshot
    pub fn vehicles(&self) -> FleetSnapshot {
        self.vehicles.borrow().clone()
    }

    pub fn subscribe_vehicles(&self) -> watch::Receiver<FleetSnapshot> {
        self.vehicles.clone()
    }

    pub fn roster(&self) -> Arc<FleetRoster> {
        self.roster.borrow().clone()
    }

    pub fn subscribe_overspeed(&self) -> broadcast::Receiver<OverspeedIncident> {
        self.incidents.subscribe()
    }

    /// False while a refresh has live processing suspended
    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    pub fn subscribe_live(&self) -> watch::Receiver<bool> {
        self.live.clone()
    }

    pub async fn start_alley(
        &self,
        vehicle_id: &str,
        route: &str,
    ) -> Result<DispatchLogId, DispatchError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::StartAlley {
            vehicle_id: vehicle_id.to_string(),
            route: route.to_string(),
            reply,
        };
        self.cmd_tx.send(cmd).await.map_err(|_| DispatchError::EngineUnavailable)?;
        rx.await.map_err(|_| DispatchError::EngineUnavailable)?
    }

    pub async fn confirm_dispatch(
        &self,
        vehicle_id: &str,
        route: &str,
    ) -> Result<DispatchLogId, DispatchError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::ConfirmDispatch {
            vehicle_id: vehicle_id.to_string(),
            route: route.to_string(),
            reply,
        };
        self.cmd_tx.send(cmd).await.map_err(|_| DispatchError::EngineUnavailable)?;
        rx.await.map_err(|_| DispatchError::EngineUnavailable)?
    }

    /// Suspend, refetch and resume; concurrent calls share one refresh
    pub async fn refresh(&self) -> Result<RefreshSummary, RefreshError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Refresh { reply })
            .await
            .map_err(|_| RefreshError::EngineUnavailable)?;
        rx.await.map_err(|_| RefreshError::EngineUnavailable)?
    }
}
