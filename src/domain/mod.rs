//! Domain models - core dispatch types
//!
//! This module contains the canonical data types used throughout the system:
//! - `VehicleEvent` - normalized tracker sample
//! - `VehicleState` - per-tracker reconciled state
//! - `ZoneDefinition` - terminal geofences
//! - `FleetRoster` - assignments joined with active dispatch logs

pub mod roster;
pub mod types;
pub mod zone;

// Re-export commonly used types at module level
pub use roster::{BusAssignment, FleetRoster};
pub use types::{
    DispatchContext, DispatchLogId, DispatchStatus, IconKind, InboundRecord, OverspeedIncident,
    Position, TrackerIdent, Trail, VehicleEvent, VehicleState,
};
pub use zone::{default_zones, Coordinate, ZoneDefinition};
