//! Fleet roster: vehicle assignments joined with their active dispatch logs
//!
//! The roster is the authoritative view fetched from the dispatch API. It
//! supplies the `vehicle_assignment_id` every dispatch command needs and is
//! used to reconcile the state store after a refresh.

use crate::domain::types::{DispatchContext, DispatchLogId, DispatchStatus, IconKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Assignment record from `GET /user/dispatcher/assignments/all`
#[derive(Debug, Clone, Deserialize)]
pub struct VehicleAssignmentRecord {
    pub vehicle_assignment_id: i64,
    pub vehicle: AssignedVehicle,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignedVehicle {
    #[serde(deserialize_with = "deserialize_id_string")]
    pub vehicle_id: String,
}

/// Dispatch log record from `GET /user/dispatcher/dispatch_logs/all`
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchLogRecord {
    pub dispatch_logs_id: DispatchLogId,
    pub vehicle_assignment_id: i64,
    pub status: String,
    #[serde(default)]
    pub route: Option<String>,
}

/// Vehicle IDs arrive as either JSON strings or integers
fn deserialize_id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct IdVisitor;

    impl<'de> Visitor<'de> for IdVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer id")
        }

        fn visit_str<E>(self, value: &str) -> Result<String, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_u64<E>(self, value: u64) -> Result<String, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_i64<E>(self, value: i64) -> Result<String, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

/// One bus as shown in the dispatcher's bus list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusAssignment {
    pub vehicle_id: String,
    pub vehicle_assignment_id: i64,
    pub status: DispatchStatus,
    pub route: String,
    pub dispatch_log_id: Option<DispatchLogId>,
}

impl BusAssignment {
    pub fn display_name(&self) -> String {
        format!("BUS {}", self.vehicle_id)
    }

    pub fn color(&self) -> &'static str {
        IconKind::for_status(self.status).color()
    }

    /// Dispatch context implied by this row, `None` when idle
    pub fn dispatch_context(&self) -> Option<DispatchContext> {
        match (self.status, self.dispatch_log_id) {
            (DispatchStatus::Idle, _) | (_, None) => None,
            (status, Some(id)) => Some(DispatchContext { dispatch_log_id: id, status }),
        }
    }
}

/// Snapshot of all assigned buses
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetRoster {
    buses: Vec<BusAssignment>,
    fetched_at: Option<DateTime<Utc>>,
}

impl FleetRoster {
    /// Join assignments with dispatch logs
    ///
    /// For each assignment the first log in response order with an active
    /// status ("on alley" / "on road") wins; "alley_completed" and any other
    /// status are ignored, leaving the bus idle.
    pub fn build(
        assignments: Vec<VehicleAssignmentRecord>,
        dispatches: &[DispatchLogRecord],
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let buses = assignments
            .into_iter()
            .map(|assignment| {
                let active = dispatches.iter().find_map(|log| {
                    if log.vehicle_assignment_id != assignment.vehicle_assignment_id {
                        return None;
                    }
                    match DispatchStatus::from_wire(&log.status) {
                        Some(status @ (DispatchStatus::OnAlley | DispatchStatus::OnRoad)) => {
                            Some((status, log))
                        }
                        _ => None,
                    }
                });

                match active {
                    Some((status, log)) => BusAssignment {
                        vehicle_id: assignment.vehicle.vehicle_id,
                        vehicle_assignment_id: assignment.vehicle_assignment_id,
                        status,
                        route: log.route.clone().unwrap_or_default(),
                        dispatch_log_id: Some(log.dispatch_logs_id),
                    },
                    None => BusAssignment {
                        vehicle_id: assignment.vehicle.vehicle_id,
                        vehicle_assignment_id: assignment.vehicle_assignment_id,
                        status: DispatchStatus::Idle,
                        route: String::new(),
                        dispatch_log_id: None,
                    },
                }
            })
            .collect();

        Self { buses, fetched_at: Some(fetched_at) }
    }

    pub fn from_buses(buses: Vec<BusAssignment>) -> Self {
        Self { buses, fetched_at: None }
    }

    pub fn buses(&self) -> &[BusAssignment] {
        &self.buses
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    pub fn find(&self, vehicle_id: &str) -> Option<&BusAssignment> {
        self.buses.iter().find(|b| b.vehicle_id == vehicle_id)
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    /// Record a locally applied transition so the bus list stays in step
    /// until the next fetch
    pub(crate) fn set_dispatch(
        &mut self,
        vehicle_id: &str,
        context: Option<DispatchContext>,
        route: Option<&str>,
    ) {
        if let Some(bus) = self.buses.iter_mut().find(|b| b.vehicle_id == vehicle_id) {
            match context {
                Some(ctx) => {
                    bus.status = ctx.status;
                    bus.dispatch_log_id = Some(ctx.dispatch_log_id);
                }
                None => {
                    bus.status = DispatchStatus::Idle;
                    bus.dispatch_log_id = None;
                    bus.route.clear();
                }
            }
            if let Some(route) = route {
                bus.route = route.to_string();
            }
        }
    }
}
