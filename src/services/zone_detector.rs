//! Terminal arrival detection
//!
//! A position matches a zone when it lies inside the tolerance box of any of
//! the zone's boundary samples. Plain degree deltas, no geodesic distance.

use crate::domain::types::Position;
use crate::domain::zone::ZoneDefinition;

pub const DEFAULT_TOLERANCE_DEG: f64 = 1e-4;

pub struct ZoneArrivalDetector {
    zones: Vec<ZoneDefinition>,
    tolerance_deg: f64,
}

impl ZoneArrivalDetector {
    pub fn new(zones: Vec<ZoneDefinition>, tolerance_deg: f64) -> Self {
        Self { zones, tolerance_deg }
    }

    pub fn zones(&self) -> &[ZoneDefinition] {
        &self.zones
    }

    /// First zone in definition order containing the position
    pub fn matches(&self, position: &Position) -> Option<&ZoneDefinition> {
        self.zones.iter().find(|zone| {
            zone.boundary_points.iter().any(|p| {
                (p.latitude - position.latitude).abs() < self.tolerance_deg
                    && (p.longitude - position.longitude).abs() < self.tolerance_deg
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::zone::{default_zones, Coordinate};

    fn detector() -> ZoneArrivalDetector {
        ZoneArrivalDetector::new(default_zones(), DEFAULT_TOLERANCE_DEG)
    }

    #[test]
    fn test_boundary_point_matches() {
        let d = detector();
        let zone = d.matches(&Position::new(8.4663228, 124.5853069)).unwrap();
        assert_eq!(zone.name, "Canitoan");

        let zone = d.matches(&Position::new(8.4759746, 124.6507055)).unwrap();
        assert_eq!(zone.name, "Cogon");
    }

    #[test]
    fn test_tolerance_is_exclusive() {
        let zone = ZoneDefinition::new(
            "Test",
            Coordinate::new(8.0, 124.0),
            vec![Coordinate::new(8.0, 124.0)],
        );
        let d = ZoneArrivalDetector::new(vec![zone], 0.5);

        assert!(d.matches(&Position::new(8.4, 124.4)).is_some());
        assert!(d.matches(&Position::new(8.5, 124.0)).is_none());
        assert!(d.matches(&Position::new(8.0, 123.5)).is_none());
    }

    #[test]
    fn test_outside_all_zones() {
        // Between Silver Creek and Cogon
        assert!(detector().matches(&Position::new(8.4760, 124.6300)).is_none());
    }

    #[test]
    fn test_first_zone_wins() {
        let a = ZoneDefinition::new("A", Coordinate::new(1.0, 1.0), vec![Coordinate::new(1.0, 1.0)]);
        let b = ZoneDefinition::new("B", Coordinate::new(1.0, 1.0), vec![Coordinate::new(1.0, 1.0)]);
        let d = ZoneArrivalDetector::new(vec![a, b], DEFAULT_TOLERANCE_DEG);
        assert_eq!(d.matches(&Position::new(1.0, 1.0)).unwrap().name, "A");
    }
}
