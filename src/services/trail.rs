//! Trail accumulation for map polylines

use crate::domain::types::{Position, Trail};

pub const DEFAULT_MAX_POINTS: usize = 10_000;

/// Appends positions to trails, bounded by `max_points`
#[derive(Debug, Clone, Copy)]
pub struct TrailAccumulator {
    max_points: usize,
    dedupe_consecutive: bool,
}

impl Default for TrailAccumulator {
    fn default() -> Self {
        Self { max_points: DEFAULT_MAX_POINTS, dedupe_consecutive: false }
    }
}

impl TrailAccumulator {
    pub fn new(max_points: usize, dedupe_consecutive: bool) -> Self {
        Self { max_points: max_points.max(1), dedupe_consecutive }
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    /// Push a position, dropping the oldest points beyond the bound
    ///
    /// Returns false only when consecutive dedupe skipped the point.
    pub fn append(&self, trail: &mut Trail, position: Position) -> bool {
        if self.dedupe_consecutive {
            if let Some(last) = trail.last() {
                if last.latitude == position.latitude && last.longitude == position.longitude {
                    return false;
                }
            }
        }
        trail.push(position);
        trail.trim_to(self.max_points);
        true
    }
}
