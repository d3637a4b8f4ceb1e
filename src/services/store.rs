//! Vehicle state store
//!
//! One `VehicleState` per tracker ident, owned by the engine. Every mutation
//! publishes a fresh fleet snapshot on a latest-wins watch channel; readers
//! (the presentation snapshot and the persistence writer) never touch the
//! map directly. Trails are shared with the snapshots rather than copied,
//! so a publish costs one pointer per tracker.

use crate::domain::types::{
    DispatchContext, TrackerIdent, VehicleEvent, VehicleState,
};
use crate::services::trail::TrailAccumulator;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub type FleetSnapshot = Arc<[VehicleState]>;

pub struct VehicleStateStore {
    /// Keyed by ident so iteration order is stable
    states: BTreeMap<TrackerIdent, VehicleState>,
    trail: TrailAccumulator,
    publisher: Option<watch::Sender<FleetSnapshot>>,
}

impl VehicleStateStore {
    pub fn new(trail: TrailAccumulator) -> Self {
        Self { states: BTreeMap::new(), trail, publisher: None }
    }

    /// Build a store from restored states, re-applying the trail bound
    pub fn from_states(states: Vec<VehicleState>, trail: TrailAccumulator) -> Self {
        let states = states
            .into_iter()
            .map(|mut state| {
                state.trail.trim_to(trail.max_points());
                (state.tracker_ident.clone(), state)
            })
            .collect();
        Self { states, trail, publisher: None }
    }

    /// Attach a snapshot publisher and return its receiver
    ///
    /// The receiver starts with the current contents.
    pub fn subscribe(&mut self) -> watch::Receiver<FleetSnapshot> {
        match &self.publisher {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(self.snapshot());
                self.publisher = Some(tx);
                rx
            }
        }
    }

    fn snapshot(&self) -> FleetSnapshot {
        self.states.values().cloned().collect()
    }

    fn publish(&self) {
        if let Some(tx) = &self.publisher {
            tx.send_replace(self.snapshot());
        }
    }

    /// Merge an event into the table and return the updated state
    pub fn upsert(&mut self, event: &VehicleEvent) -> VehicleState {
        let trail = self.trail;
        let state = self.states.entry(event.tracker_ident.clone()).or_insert_with(|| {
            debug!(tracker = %event.tracker_ident, "vehicle_created");
            VehicleState::new(event.tracker_ident.clone(), event.vehicle_id.clone())
        });

        state.vehicle_id.clone_from(&event.vehicle_id);
        if let Some(position) = event.position {
            state.last_position = Some(position);
            state.last_timestamp = Some(event.timestamp_utc);
            trail.append(&mut state.trail, position);
        }
        state.set_dispatch(event.dispatch_context);

        let updated = state.clone();
        self.publish();
        updated
    }

    pub fn get(&self, tracker_ident: &TrackerIdent) -> Option<VehicleState> {
        self.states.get(tracker_ident).cloned()
    }

    /// All states in tracker ident order
    pub fn all(&self) -> Vec<VehicleState> {
        self.states.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Returns false if the tracker is unknown
    pub fn clear_trail(&mut self, tracker_ident: &TrackerIdent) -> bool {
        match self.states.get_mut(tracker_ident) {
            Some(state) => {
                state.trail.clear();
                self.publish();
                true
            }
            None => false,
        }
    }

    pub fn clear_all_trails(&mut self) {
        for state in self.states.values_mut() {
            state.trail.clear();
        }
        self.publish();
    }

    /// Set the dispatch status of one tracker outside the event path
    pub fn apply_dispatch(
        &mut self,
        tracker_ident: &TrackerIdent,
        context: Option<DispatchContext>,
    ) -> bool {
        match self.states.get_mut(tracker_ident) {
            Some(state) => {
                state.set_dispatch(context);
                self.publish();
                true
            }
            None => false,
        }
    }

    /// Apply a dispatch context to every tracker of a vehicle, optionally
    /// clearing their trails; returns the number of trackers touched
    pub fn apply_vehicle_dispatch(
        &mut self,
        vehicle_id: &str,
        context: Option<DispatchContext>,
        clear_trail: bool,
    ) -> usize {
        let mut touched = 0;
        for state in self.states.values_mut().filter(|s| s.vehicle_id == vehicle_id) {
            state.set_dispatch(context);
            if clear_trail {
                state.trail.clear();
            }
            touched += 1;
        }
        if touched > 0 {
            self.publish();
        }
        touched
    }

    /// Trackers currently reporting for a vehicle
    pub fn trackers_for_vehicle(&self, vehicle_id: &str) -> Vec<TrackerIdent> {
        self.states
            .values()
            .filter(|s| s.vehicle_id == vehicle_id)
            .map(|s| s.tracker_ident.clone())
            .collect()
    }
}
