//! Dispatch lifecycle coordination
//!
//! Per-vehicle state machine `idle -> on_alley -> on_road -> idle`. The
//! coordinator holds the guards (in-flight sets, recently ended log ids,
//! alley start times) and the API call sequences; the engine owns it and
//! applies the outcomes to the store.

use crate::domain::roster::FleetRoster;
use crate::domain::types::{DispatchLogId, DispatchStatus, VehicleEvent, VehicleState};
use crate::infra::metrics::Metrics;
use crate::io::api::DispatchApi;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How many ended log ids are remembered for stale-context filtering
pub const ENDED_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("vehicle {0} is not known")]
    UnknownVehicle(String),
    #[error("vehicle {0} has no vehicle assignment")]
    NoAssignment(String),
    #[error("vehicle {vehicle_id} is {actual}, expected {expected}")]
    InvalidState { vehicle_id: String, actual: DispatchStatus, expected: DispatchStatus },
    #[error("vehicle {0} has no active dispatch log")]
    MissingDispatchLog(String),
    #[error("alley interval for vehicle {vehicle_id} has {remaining_secs}s left")]
    AlleyIntervalRunning { vehicle_id: String, remaining_secs: u64 },
    #[error("a command for vehicle {0} is already in progress")]
    CommandInFlight(String),
    #[error("{call} failed: {message}")]
    Api { call: &'static str, message: String },
    #[error("dispatch engine is not running")]
    EngineUnavailable,
}

/// Parameters for a start-alley call, handed out by `begin_start_alley`
#[derive(Debug, Clone, PartialEq)]
pub struct AlleyRequest {
    pub vehicle_id: String,
    pub vehicle_assignment_id: i64,
    pub route: String,
}

/// Parameters for a confirm-dispatch call, handed out by `begin_confirm`
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmRequest {
    pub vehicle_id: String,
    pub vehicle_assignment_id: i64,
    pub alley_log_id: DispatchLogId,
    pub route: String,
}

/// Insertion-ordered set that forgets its oldest entries past a capacity
struct RecentSet {
    order: VecDeque<DispatchLogId>,
    members: FxHashSet<DispatchLogId>,
    capacity: usize,
}

impl RecentSet {
    fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), members: FxHashSet::default(), capacity: capacity.max(1) }
    }

    fn insert(&mut self, id: DispatchLogId) {
        if !self.members.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
    }

    fn contains(&self, id: &DispatchLogId) -> bool {
        self.members.contains(id)
    }

    /// Oldest first
    fn to_vec(&self) -> Vec<DispatchLogId> {
        self.order.iter().copied().collect()
    }
}

pub struct DispatchCoordinator {
    /// Log ids with an end-dispatch call outstanding
    ending: FxHashSet<DispatchLogId>,
    /// Log ids whose segment was closed by us
    ended: RecentSet,
    /// Vehicles with a start-alley or confirm call outstanding
    commands_in_flight: FxHashSet<String>,
    alley_started: FxHashMap<String, Instant>,
    alley_interval: Duration,
}

impl DispatchCoordinator {
    pub fn new(alley_interval: Duration) -> Self {
        Self {
            ending: FxHashSet::default(),
            ended: RecentSet::new(ENDED_LOG_CAPACITY),
            commands_in_flight: FxHashSet::default(),
            alley_started: FxHashMap::default(),
            alley_interval,
        }
    }

    /// Claim the auto-completion of a state that just arrived in a zone
    ///
    /// Returns the log id to end at most once: later calls for the same log
    /// id return `None` while the call is outstanding or after it succeeded.
    pub fn claim_auto_complete(&mut self, state: &VehicleState) -> Option<DispatchLogId> {
        if state.dispatch_status() != DispatchStatus::OnRoad {
            return None;
        }
        let log_id = state.dispatch_log_id()?;
        if self.ended.contains(&log_id) || !self.ending.insert(log_id) {
            debug!(dispatch_log_id = %log_id, "auto_complete_suppressed");
            return None;
        }
        Some(log_id)
    }

    pub fn end_dispatch_succeeded(&mut self, log_id: DispatchLogId) {
        self.ending.remove(&log_id);
        self.ended.insert(log_id);
    }

    /// Release the claim so the next matching event retries
    pub fn end_dispatch_failed(&mut self, log_id: DispatchLogId) {
        self.ending.remove(&log_id);
    }

    /// Seed the ended set from a persisted snapshot, oldest first
    pub fn restore_ended(&mut self, log_ids: impl IntoIterator<Item = DispatchLogId>) {
        for log_id in log_ids {
            self.ended.insert(log_id);
        }
    }

    /// Recently ended log ids, oldest first
    pub fn ended_log_ids(&self) -> Vec<DispatchLogId> {
        self.ended.to_vec()
    }

    pub fn is_ended(&self, log_id: DispatchLogId) -> bool {
        self.ended.contains(&log_id)
    }

    pub fn is_ending(&self, log_id: DispatchLogId) -> bool {
        self.ending.contains(&log_id)
    }

    /// Drop a dispatch context naming a segment we already closed
    ///
    /// Returns true if the context was stale.
    pub fn strip_stale_context(&self, event: &mut VehicleEvent) -> bool {
        match event.dispatch_context {
            Some(ctx) if self.ended.contains(&ctx.dispatch_log_id) => {
                debug!(
                    tracker = %event.tracker_ident,
                    dispatch_log_id = %ctx.dispatch_log_id,
                    "stale_dispatch_context"
                );
                event.dispatch_context = None;
                true
            }
            _ => false,
        }
    }

    fn claim_command(&mut self, vehicle_id: &str) -> Result<(), DispatchError> {
        if !self.commands_in_flight.insert(vehicle_id.to_string()) {
            return Err(DispatchError::CommandInFlight(vehicle_id.to_string()));
        }
        Ok(())
    }

    /// Validate a start-alley command and mark the vehicle busy
    ///
    /// `known_tracker` says whether any tracker reports for the vehicle, which
    /// separates "unknown vehicle" from "vehicle without assignment".
    pub fn begin_start_alley(
        &mut self,
        vehicle_id: &str,
        route: &str,
        roster: &FleetRoster,
        known_tracker: bool,
    ) -> Result<AlleyRequest, DispatchError> {
        if self.commands_in_flight.contains(vehicle_id) {
            return Err(DispatchError::CommandInFlight(vehicle_id.to_string()));
        }
        let Some(bus) = roster.find(vehicle_id) else {
            return Err(if known_tracker {
                DispatchError::NoAssignment(vehicle_id.to_string())
            } else {
                DispatchError::UnknownVehicle(vehicle_id.to_string())
            });
        };
        if bus.status != DispatchStatus::Idle {
            return Err(DispatchError::InvalidState {
                vehicle_id: vehicle_id.to_string(),
                actual: bus.status,
                expected: DispatchStatus::Idle,
            });
        }

        let request = AlleyRequest {
            vehicle_id: vehicle_id.to_string(),
            vehicle_assignment_id: bus.vehicle_assignment_id,
            route: route.to_string(),
        };
        self.claim_command(vehicle_id)?;
        Ok(request)
    }

    /// Validate a confirm-dispatch command and mark the vehicle busy
    pub fn begin_confirm(
        &mut self,
        vehicle_id: &str,
        route: &str,
        roster: &FleetRoster,
        known_tracker: bool,
    ) -> Result<ConfirmRequest, DispatchError> {
        if self.commands_in_flight.contains(vehicle_id) {
            return Err(DispatchError::CommandInFlight(vehicle_id.to_string()));
        }
        let Some(bus) = roster.find(vehicle_id) else {
            return Err(if known_tracker {
                DispatchError::NoAssignment(vehicle_id.to_string())
            } else {
                DispatchError::UnknownVehicle(vehicle_id.to_string())
            });
        };
        if bus.status != DispatchStatus::OnAlley {
            return Err(DispatchError::InvalidState {
                vehicle_id: vehicle_id.to_string(),
                actual: bus.status,
                expected: DispatchStatus::OnAlley,
            });
        }
        let Some(alley_log_id) = bus.dispatch_log_id else {
            return Err(DispatchError::MissingDispatchLog(vehicle_id.to_string()));
        };
        if let Some(started) = self.alley_started.get(vehicle_id) {
            let elapsed = started.elapsed();
            if elapsed < self.alley_interval {
                let remaining = self.alley_interval - elapsed;
                return Err(DispatchError::AlleyIntervalRunning {
                    vehicle_id: vehicle_id.to_string(),
                    remaining_secs: remaining.as_secs_f64().ceil() as u64,
                });
            }
        }

        let request = ConfirmRequest {
            vehicle_id: vehicle_id.to_string(),
            vehicle_assignment_id: bus.vehicle_assignment_id,
            alley_log_id,
            route: route.to_string(),
        };
        self.claim_command(vehicle_id)?;
        Ok(request)
    }

    /// Release the vehicle after its command finished either way
    pub fn command_finished(&mut self, vehicle_id: &str) {
        self.commands_in_flight.remove(vehicle_id);
    }

    pub fn alley_started(&mut self, vehicle_id: &str) {
        self.alley_started.insert(vehicle_id.to_string(), Instant::now());
    }

    /// The alley segment is over; its log id can no longer come back
    pub fn alley_ended(&mut self, vehicle_id: &str, alley_log_id: DispatchLogId) {
        self.alley_started.remove(vehicle_id);
        self.ended.insert(alley_log_id);
    }
}

/// Await an API call, timing it into metrics and mapping failures
async fn call<T>(
    metrics: &Metrics,
    name: &'static str,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, DispatchError> {
    let start = std::time::Instant::now();
    let result = fut.await;
    metrics.record_api_call(start.elapsed().as_millis() as u64, result.is_ok());
    result.map_err(|e| {
        warn!(call = name, error = %format!("{e:#}"), "api_call_failed");
        DispatchError::Api { call: name, message: format!("{e:#}") }
    })
}

pub async fn run_start_alley(
    api: &dyn DispatchApi,
    metrics: &Metrics,
    request: &AlleyRequest,
) -> Result<DispatchLogId, DispatchError> {
    call(metrics, "start_alley", api.start_alley(request.vehicle_assignment_id, &request.route))
        .await
}

/// End the alley, then start the road segment
///
/// The first failure aborts the sequence. A failed `start_dispatch` after a
/// successful `end_alley` is not compensated.
pub async fn run_confirm(
    api: &dyn DispatchApi,
    metrics: &Metrics,
    request: &ConfirmRequest,
) -> Result<DispatchLogId, DispatchError> {
    call(metrics, "end_alley", api.end_alley(request.alley_log_id)).await?;
    call(
        metrics,
        "start_dispatch",
        api.start_dispatch(request.vehicle_assignment_id, &request.route),
    )
    .await
}

pub async fn run_end_dispatch(
    api: &dyn DispatchApi,
    metrics: &Metrics,
    log_id: DispatchLogId,
) -> Result<(), DispatchError> {
    call(metrics, "end_dispatch", api.end_dispatch(log_id)).await
}
