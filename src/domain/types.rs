//! Shared types for fleet dispatch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Newtype wrapper for tracker identifiers (GPS device ident)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackerIdent(pub String);

impl TrackerIdent {
    pub fn new(ident: impl Into<String>) -> Self {
        Self(ident.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackerIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for server-side dispatch log IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchLogId(pub i64);

impl std::fmt::Display for DispatchLogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single GPS sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
}

impl Position {
    #[inline]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude, speed_kmh: None }
    }

    #[inline]
    pub fn with_speed(mut self, speed_kmh: f64) -> Self {
        self.speed_kmh = Some(speed_kmh);
        self
    }
}

/// Dispatch status of a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    #[default]
    Idle,
    OnAlley,
    OnRoad,
}

impl DispatchStatus {
    /// Parse the status strings used by the dispatch API ("on alley", "on road")
    ///
    /// Anything that is not an active segment (including "alley_completed")
    /// maps to `None`.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on alley" | "on_alley" => Some(DispatchStatus::OnAlley),
            "on road" | "on_road" => Some(DispatchStatus::OnRoad),
            "idle" => Some(DispatchStatus::Idle),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Idle => "idle",
            DispatchStatus::OnAlley => "on alley",
            DispatchStatus::OnRoad => "on road",
        }
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map icon for a vehicle, always derived from its dispatch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IconKind {
    IdleBus,
    AlleyBus,
    RoadBus,
}

impl IconKind {
    #[inline]
    pub fn for_status(status: DispatchStatus) -> Self {
        match status {
            DispatchStatus::Idle => IconKind::IdleBus,
            DispatchStatus::OnAlley => IconKind::AlleyBus,
            DispatchStatus::OnRoad => IconKind::RoadBus,
        }
    }

    /// Bus list card colour
    pub fn color(&self) -> &'static str {
        match self {
            IconKind::IdleBus => "#D3D3D3",
            IconKind::AlleyBus => "rgba(255, 165, 0, 1)",
            IconKind::RoadBus => "rgba(173, 255, 47, 1)",
        }
    }

    /// Map marker asset name
    pub fn asset(&self) -> &'static str {
        match self {
            IconKind::IdleBus => "bus_idle",
            IconKind::AlleyBus => "bus_on_alley",
            IconKind::RoadBus => "bus_on_road",
        }
    }
}

/// Active dispatch segment attached to an event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchContext {
    pub dispatch_log_id: DispatchLogId,
    pub status: DispatchStatus,
}

impl DispatchContext {
    pub fn on_alley(dispatch_log_id: DispatchLogId) -> Self {
        Self { dispatch_log_id, status: DispatchStatus::OnAlley }
    }

    pub fn on_road(dispatch_log_id: DispatchLogId) -> Self {
        Self { dispatch_log_id, status: DispatchStatus::OnRoad }
    }
}

/// Normalized tracker event
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleEvent {
    pub tracker_ident: TrackerIdent,
    pub vehicle_id: String,
    /// `None` for no-fix samples: no trail, zone or overspeed effects
    pub position: Option<Position>,
    pub timestamp_utc: DateTime<Utc>,
    /// `None` means the vehicle is idle
    pub dispatch_context: Option<DispatchContext>,
}

/// One raw record as delivered by the transport, before normalization
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Ordered position history for trail rendering
///
/// Points are shared between the live state and published snapshots, so
/// cloning a state is cheap; the first write after a clone copies this one
/// trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trail {
    points: Arc<VecDeque<Position>>,
}

impl Trail {
    pub fn from_points(points: impl IntoIterator<Item = Position>) -> Self {
        Self { points: Arc::new(points.into_iter().collect()) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&Position> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.points.iter()
    }

    pub(crate) fn push(&mut self, position: Position) {
        Arc::make_mut(&mut self.points).push_back(position);
    }

    pub(crate) fn trim_to(&mut self, max_points: usize) -> usize {
        let excess = self.points.len().saturating_sub(max_points);
        if excess > 0 {
            Arc::make_mut(&mut self.points).drain(..excess);
        }
        excess
    }

    pub(crate) fn clear(&mut self) {
        if !self.points.is_empty() {
            self.points = Arc::default();
        }
    }

    /// True if both trails point at the same storage
    pub fn shares_points_with(&self, other: &Trail) -> bool {
        Arc::ptr_eq(&self.points, &other.points)
    }
}

/// Latest known state of one tracker
///
/// Fields are only mutated by the state store; the icon is computed from
/// the dispatch status rather than stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub(crate) tracker_ident: TrackerIdent,
    pub(crate) vehicle_id: String,
    pub(crate) last_position: Option<Position>,
    pub(crate) last_timestamp: Option<DateTime<Utc>>,
    pub(crate) dispatch_status: DispatchStatus,
    pub(crate) dispatch_log_id: Option<DispatchLogId>,
    #[serde(default)]
    pub(crate) trail: Trail,
}

impl VehicleState {
    pub(crate) fn new(tracker_ident: TrackerIdent, vehicle_id: String) -> Self {
        Self {
            tracker_ident,
            vehicle_id,
            last_position: None,
            last_timestamp: None,
            dispatch_status: DispatchStatus::Idle,
            dispatch_log_id: None,
            trail: Trail::default(),
        }
    }

    pub fn tracker_ident(&self) -> &TrackerIdent {
        &self.tracker_ident
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn last_position(&self) -> Option<&Position> {
        self.last_position.as_ref()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    pub fn dispatch_status(&self) -> DispatchStatus {
        self.dispatch_status
    }

    pub fn dispatch_log_id(&self) -> Option<DispatchLogId> {
        self.dispatch_log_id
    }

    #[inline]
    pub fn icon_kind(&self) -> IconKind {
        IconKind::for_status(self.dispatch_status)
    }

    pub fn trail(&self) -> &Trail {
        &self.trail
    }

    /// Set status and log id together; absent context means idle
    pub(crate) fn set_dispatch(&mut self, context: Option<DispatchContext>) {
        match context {
            Some(ctx) => {
                self.dispatch_status = ctx.status;
                self.dispatch_log_id = match ctx.status {
                    DispatchStatus::Idle => None,
                    _ => Some(ctx.dispatch_log_id),
                };
            }
            None => {
                self.dispatch_status = DispatchStatus::Idle;
                self.dispatch_log_id = None;
            }
        }
    }
}

/// Report that a vehicle exceeded the speed threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverspeedIncident {
    pub dispatch_log_id: Option<DispatchLogId>,
    pub vehicle_id: String,
    pub tracker_ident: TrackerIdent,
    pub speed_kmh: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub detected_at: DateTime<Utc>,
}
