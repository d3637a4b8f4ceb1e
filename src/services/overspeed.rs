//! Overspeed detection
//!
//! Every sample above the threshold yields an incident. There is no
//! debouncing; a bus holding 60 km/h for a minute reports every sample.

use crate::domain::types::{OverspeedIncident, VehicleEvent, VehicleState};

pub const DEFAULT_THRESHOLD_KMH: f64 = 50.0;

pub struct OverspeedDetector {
    threshold_kmh: f64,
}

impl Default for OverspeedDetector {
    fn default() -> Self {
        Self { threshold_kmh: DEFAULT_THRESHOLD_KMH }
    }
}

impl OverspeedDetector {
    pub fn new(threshold_kmh: f64) -> Self {
        Self { threshold_kmh }
    }

    pub fn threshold_kmh(&self) -> f64 {
        self.threshold_kmh
    }

    /// Evaluate an event against the state it produced
    ///
    /// No-position events and samples without speed never trigger.
    pub fn evaluate(&self, event: &VehicleEvent, state: &VehicleState) -> Option<OverspeedIncident> {
        let position = event.position?;
        let speed_kmh = position.speed_kmh?;
        if speed_kmh <= self.threshold_kmh {
            return None;
        }

        Some(OverspeedIncident {
            dispatch_log_id: state.dispatch_log_id(),
            vehicle_id: state.vehicle_id().to_string(),
            tracker_ident: state.tracker_ident().clone(),
            speed_kmh,
            latitude: position.latitude,
            longitude: position.longitude,
            detected_at: event.timestamp_utc,
        })
    }
}
