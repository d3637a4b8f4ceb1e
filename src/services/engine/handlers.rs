//! Handlers for the Engine
//!
//! Records, commands and completions each come through one entry point here.
//! Handlers never await: API work is spawned and its outcome is applied when
//! the matching `Completion` arrives.

use super::{Command, Completion, Engine, LocalTransition};
use crate::domain::roster::FleetRoster;
use crate::domain::types::{
    DispatchContext, DispatchLogId, InboundRecord, OverspeedIncident, VehicleEvent,
};
use crate::services::coordinator::{
    run_confirm, run_end_dispatch, run_start_alley, AlleyRequest, ConfirmRequest,
    DispatchCoordinator, DispatchError,
};
use crate::services::normalizer::normalize;
use crate::services::refresh::{fetch_roster, reset_and_fetch, RefreshError, RefreshSummary};
use std::time::Instant;
use tracing::{debug, info, warn};

impl Engine {
    /// Normalize and apply one raw record
    pub(crate) fn process_record(&mut self, record: InboundRecord) {
        let start = Instant::now();

        if !self.refresh.is_live() {
            self.metrics.record_event_dropped_suspended();
            debug!("record_dropped_refresh_in_progress");
            return;
        }

        let Some(event) = normalize(&record.payload, record.received_at) else {
            self.metrics.record_event_rejected();
            debug!("record_rejected");
            return;
        };

        self.process_event(event);
        self.metrics.record_event_processed(start.elapsed().as_micros() as u64);
    }

    pub(crate) fn process_event(&mut self, mut event: VehicleEvent) {
        self.resolve_vehicle(&mut event);
        if event.dispatch_context.is_none() {
            event.dispatch_context =
                self.roster.find(&event.vehicle_id).and_then(|bus| bus.dispatch_context());
        }
        // Whichever source named it, a closed segment means idle
        self.coordinator.strip_stale_context(&mut event);

        let state = self.store.upsert(&event);

        let Some(position) = event.position else {
            return;
        };

        if let Some(zone) = self.zones.matches(&position) {
            self.metrics.record_zone_arrival();
            debug!(
                tracker = %event.tracker_ident,
                vehicle_id = %event.vehicle_id,
                zone = %zone.name,
                status = %state.dispatch_status(),
                "zone_arrival"
            );
            if let Some(log_id) = self.coordinator.claim_auto_complete(&state) {
                info!(
                    vehicle_id = %event.vehicle_id,
                    dispatch_log_id = %log_id,
                    zone = %zone.name,
                    "auto_complete_started"
                );
                self.spawn_end_dispatch(event.vehicle_id.clone(), log_id);
            }
        }

        if let Some(incident) = self.overspeed.evaluate(&event, &state) {
            self.emit_overspeed(incident);
        }
    }

    /// Map a tracker that reported no vehicle id onto its configured vehicle
    fn resolve_vehicle(&self, event: &mut VehicleEvent) {
        if event.vehicle_id != event.tracker_ident.as_str() {
            return;
        }
        if let Some(vehicle_id) = self.config.tracker_vehicle(event.tracker_ident.as_str()) {
            event.vehicle_id = vehicle_id.to_string();
        }
    }

    fn spawn_end_dispatch(&mut self, vehicle_id: String, log_id: DispatchLogId) {
        let api = self.apis.dispatch.clone();
        let metrics = self.metrics.clone();
        self.spawn_task(async move {
            let result = run_end_dispatch(api.as_ref(), &metrics, log_id).await;
            Completion::DispatchEnded { vehicle_id, log_id, result }
        });
    }

    fn emit_overspeed(&mut self, incident: OverspeedIncident) {
        self.metrics.record_overspeed();
        warn!(
            vehicle_id = %incident.vehicle_id,
            tracker = %incident.tracker_ident,
            speed_kmh = incident.speed_kmh,
            threshold_kmh = self.overspeed.threshold_kmh(),
            dispatch_log_id = ?incident.dispatch_log_id,
            "overspeed_detected"
        );

        // No receivers is fine
        let _ = self.incidents.send(incident.clone());

        let api = self.apis.overspeed.clone();
        let metrics = self.metrics.clone();
        self.spawn_task(async move {
            let start = Instant::now();
            let result = api.create_overspeed_record(&incident).await;
            metrics.record_api_call(start.elapsed().as_millis() as u64, result.is_ok());
            if let Err(e) = result {
                warn!(
                    vehicle_id = %incident.vehicle_id,
                    error = %format!("{e:#}"),
                    "overspeed_report_failed"
                );
            }
            Completion::Detached
        });
    }

    pub(crate) fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartAlley { vehicle_id, route, reply } => {
                let known = !self.store.trackers_for_vehicle(&vehicle_id).is_empty();
                match self.coordinator.begin_start_alley(&vehicle_id, &route, &self.roster, known) {
                    Ok(request) => {
                        info!(vehicle_id = %vehicle_id, route = %route, "start_alley_requested");
                        let api = self.apis.dispatch.clone();
                        let metrics = self.metrics.clone();
                        self.spawn_task(async move {
                            let result = run_start_alley(api.as_ref(), &metrics, &request).await;
                            Completion::AlleyStarted { request, result, reply }
                        });
                    }
                    Err(e) => {
                        info!(vehicle_id = %vehicle_id, error = %e, "start_alley_rejected");
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::ConfirmDispatch { vehicle_id, route, reply } => {
                let known = !self.store.trackers_for_vehicle(&vehicle_id).is_empty();
                match self.coordinator.begin_confirm(&vehicle_id, &route, &self.roster, known) {
                    Ok(request) => {
                        info!(
                            vehicle_id = %vehicle_id,
                            route = %route,
                            alley_log_id = %request.alley_log_id,
                            "confirm_dispatch_requested"
                        );
                        let api = self.apis.dispatch.clone();
                        let metrics = self.metrics.clone();
                        self.spawn_task(async move {
                            let result = run_confirm(api.as_ref(), &metrics, &request).await;
                            Completion::DispatchConfirmed { request, result, reply }
                        });
                    }
                    Err(e) => {
                        info!(vehicle_id = %vehicle_id, error = %e, "confirm_dispatch_rejected");
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Refresh { reply } => {
                if self.refresh.request(reply) {
                    self.start_refresh();
                }
            }
        }
    }

    /// Clear trails and refetch the roster
    ///
    /// The persisted snapshot is invalidated by the persistence writer when
    /// it sees `live` drop, and rewritten only after the refresh resumes.
    fn start_refresh(&mut self) {
        self.metrics.record_refresh();
        self.store.clear_all_trails();
        self.refresh_journal = Some(Vec::new());

        let apis = self.apis.clone();
        let metrics = self.metrics.clone();
        let seq = self.roster_seq;
        self.spawn_task(async move {
            let start = Instant::now();
            let result = reset_and_fetch(&apis).await;
            metrics.record_api_call(start.elapsed().as_millis() as u64, result.is_ok());
            Completion::RosterFetched {
                manual: true,
                seq,
                result: result.map_err(|e| format!("{e:#}")),
            }
        });
    }

    /// Start a background roster fetch unless one is running
    pub(crate) fn start_roster_sync(&mut self) {
        if self.sync_in_flight || !self.refresh.is_live() {
            return;
        }
        self.sync_in_flight = true;

        let api = self.apis.dispatch.clone();
        let metrics = self.metrics.clone();
        let seq = self.roster_seq;
        self.spawn_task(async move {
            let start = Instant::now();
            let result = fetch_roster(api.as_ref()).await;
            metrics.record_api_call(start.elapsed().as_millis() as u64, result.is_ok());
            Completion::RosterFetched {
                manual: false,
                seq,
                result: result.map_err(|e| format!("{e:#}")),
            }
        });
    }

    pub(crate) fn handle_completion(&mut self, done: Completion) {
        self.pending_tasks = self.pending_tasks.saturating_sub(1);

        match done {
            Completion::DispatchEnded { vehicle_id, log_id, result } => {
                self.on_dispatch_ended(&vehicle_id, log_id, result)
            }
            Completion::AlleyStarted { request, result, reply } => {
                let result = self.on_alley_started(&request, result);
                let _ = reply.send(result);
            }
            Completion::DispatchConfirmed { request, result, reply } => {
                let result = self.on_dispatch_confirmed(&request, result);
                let _ = reply.send(result);
            }
            Completion::RosterFetched { manual: true, seq, result } => match result {
                Ok(mut roster) => {
                    let journal = self.refresh_journal.take().unwrap_or_default();
                    if seq != self.roster_seq {
                        // Fetched data predates these transitions
                        debug!(transitions = journal.len(), "refresh_replaying_local_transitions");
                        for t in &journal {
                            roster.set_dispatch(&t.vehicle_id, t.context, t.route.as_deref());
                        }
                    }
                    let summary = RefreshSummary::for_roster(&roster);
                    self.apply_roster(roster);
                    self.refresh.fetched(summary);
                    let delay = self.refresh.settle_delay();
                    self.spawn_task(async move {
                        tokio::time::sleep(delay).await;
                        Completion::RefreshSettled
                    });
                }
                Err(message) => {
                    self.refresh_journal = None;
                    self.refresh.failed(RefreshError::Fetch(message));
                }
            },
            Completion::RosterFetched { manual: false, seq, result } => {
                self.sync_in_flight = false;
                match result {
                    Ok(roster) if seq != self.roster_seq || !self.refresh.is_live() => {
                        debug!(buses = roster.len(), "roster_sync_discarded");
                    }
                    Ok(roster) => {
                        debug!(buses = roster.len(), "roster_synced");
                        self.apply_roster(roster);
                    }
                    Err(message) => warn!(error = %message, "roster_sync_failed"),
                }
            }
            Completion::RefreshSettled => self.refresh.settled(),
            Completion::Detached => {}
        }
    }

    fn on_dispatch_ended(
        &mut self,
        vehicle_id: &str,
        log_id: DispatchLogId,
        result: Result<(), DispatchError>,
    ) {
        match result {
            Ok(()) => {
                self.coordinator.end_dispatch_succeeded(log_id);
                if let Some(persistence) = &self.persistence {
                    // Picked up by the writer with the store publish below
                    persistence.set_ended_log_ids(self.coordinator.ended_log_ids());
                }
                let trackers = self.store.apply_vehicle_dispatch(vehicle_id, None, true);
                self.commit_transition(vehicle_id, None, None);
                self.metrics.record_auto_completion();
                info!(
                    vehicle_id = %vehicle_id,
                    dispatch_log_id = %log_id,
                    trackers,
                    "dispatch_auto_completed"
                );
            }
            Err(e) => {
                // Next matching event retries
                self.coordinator.end_dispatch_failed(log_id);
                warn!(vehicle_id = %vehicle_id, dispatch_log_id = %log_id, error = %e, "auto_complete_failed");
            }
        }
    }

    fn on_alley_started(
        &mut self,
        request: &AlleyRequest,
        result: Result<DispatchLogId, DispatchError>,
    ) -> Result<DispatchLogId, DispatchError> {
        self.coordinator.command_finished(&request.vehicle_id);
        let log_id = result?;

        let ctx = DispatchContext::on_alley(log_id);
        self.coordinator.alley_started(&request.vehicle_id);
        self.store.apply_vehicle_dispatch(&request.vehicle_id, Some(ctx), false);
        self.commit_transition(&request.vehicle_id, Some(ctx), Some(&request.route));
        info!(
            vehicle_id = %request.vehicle_id,
            route = %request.route,
            dispatch_log_id = %log_id,
            "alley_started"
        );
        Ok(log_id)
    }

    fn on_dispatch_confirmed(
        &mut self,
        request: &ConfirmRequest,
        result: Result<DispatchLogId, DispatchError>,
    ) -> Result<DispatchLogId, DispatchError> {
        self.coordinator.command_finished(&request.vehicle_id);
        let log_id = result?;

        let ctx = DispatchContext::on_road(log_id);
        self.coordinator.alley_ended(&request.vehicle_id, request.alley_log_id);
        self.store.apply_vehicle_dispatch(&request.vehicle_id, Some(ctx), false);
        self.commit_transition(&request.vehicle_id, Some(ctx), Some(&request.route));
        info!(
            vehicle_id = %request.vehicle_id,
            route = %request.route,
            alley_log_id = %request.alley_log_id,
            dispatch_log_id = %log_id,
            "dispatch_confirmed"
        );
        Ok(log_id)
    }

    /// Record a local dispatch transition on the roster
    fn commit_transition(
        &mut self,
        vehicle_id: &str,
        context: Option<DispatchContext>,
        route: Option<&str>,
    ) {
        self.roster.set_dispatch(vehicle_id, context, route);
        self.roster_seq += 1;
        if let Some(journal) = self.refresh_journal.as_mut() {
            journal.push(LocalTransition {
                vehicle_id: vehicle_id.to_string(),
                context,
                route: route.map(str::to_string),
            });
        }
        self.publish_roster();
    }

    /// Replace the roster and reconcile every known tracker with it
    ///
    /// Rows naming a segment we already closed are treated as idle; the
    /// backend may not have caught up yet.
    pub(crate) fn apply_roster(&mut self, mut roster: FleetRoster) {
        strip_ended_rows(&self.coordinator, &mut roster);

        for bus in roster.buses() {
            self.store.apply_vehicle_dispatch(&bus.vehicle_id, bus.dispatch_context(), false);
        }

        self.roster = roster;
        self.publish_roster();
    }
}

/// Set roster rows that name an ended log id to idle
pub(crate) fn strip_ended_rows(coordinator: &DispatchCoordinator, roster: &mut FleetRoster) {
    let stale: Vec<String> = roster
        .buses()
        .iter()
        .filter(|bus| bus.dispatch_log_id.is_some_and(|id| coordinator.is_ended(id)))
        .map(|bus| bus.vehicle_id.clone())
        .collect();
    for vehicle_id in &stale {
        debug!(vehicle_id = %vehicle_id, "roster_row_stale");
        roster.set_dispatch(vehicle_id, None, None);
    }
}
