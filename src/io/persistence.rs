//! Fleet snapshot persistence
//!
//! The whole state table is stored as one JSON document under a single key.
//! Restoring never fails: a missing, unreadable or corrupt blob yields an
//! empty fleet and a warning.
//!
//! The snapshot also carries the recently ended dispatch log ids, so a
//! redelivered record naming a closed segment stays stale after a restart.

use crate::domain::types::{DispatchLogId, IconKind, TrackerIdent, VehicleState};
use crate::infra::metrics::Metrics;
use crate::io::kv::KeyValueStore;
use crate::services::store::FleetSnapshot;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SNAPSHOT_KEY: &str = "fleet.snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub vehicles: Vec<VehicleState>,
    /// Icon per tracker at save time, kept for consumers that read the blob
    /// directly; on restore the icon is recomputed from the status
    #[serde(default)]
    pub icons: BTreeMap<TrackerIdent, IconKind>,
    /// Oldest first
    #[serde(default)]
    pub ended_log_ids: Vec<DispatchLogId>,
}

pub struct PersistenceBridge {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    /// Mirrors the engine's ended set; written with every save
    ended: Mutex<Vec<DispatchLogId>>,
}

impl PersistenceBridge {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv, key: SNAPSHOT_KEY.to_string(), ended: Mutex::new(Vec::new()) }
    }

    pub fn ended_log_ids(&self) -> Vec<DispatchLogId> {
        self.ended.lock().clone()
    }

    pub fn set_ended_log_ids(&self, log_ids: Vec<DispatchLogId>) {
        *self.ended.lock() = log_ids;
    }

    pub fn snapshot(states: &[VehicleState]) -> PersistedSnapshot {
        PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            vehicles: states.to_vec(),
            icons: states.iter().map(|s| (s.tracker_ident().clone(), s.icon_kind())).collect(),
            ended_log_ids: Vec::new(),
        }
    }

    pub fn encode(snapshot: &PersistedSnapshot) -> Result<String> {
        serde_json::to_string(snapshot).context("Failed to encode fleet snapshot")
    }

    pub fn decode(blob: &str) -> Result<PersistedSnapshot> {
        let snapshot: PersistedSnapshot =
            serde_json::from_str(blob).context("Failed to decode fleet snapshot")?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!("unsupported snapshot version {}", snapshot.version);
        }
        Ok(snapshot)
    }

    /// Decode a blob into states, treating any problem as an empty fleet
    pub fn restore(blob: Option<&str>) -> Vec<VehicleState> {
        Self::restore_snapshot(blob).map(|s| s.vehicles).unwrap_or_default()
    }

    fn restore_snapshot(blob: Option<&str>) -> Option<PersistedSnapshot> {
        let snapshot = match Self::decode(blob?) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "snapshot_discarded");
                return None;
            }
        };

        for state in &snapshot.vehicles {
            if let Some(icon) = snapshot.icons.get(state.tracker_ident()) {
                if *icon != state.icon_kind() {
                    warn!(
                        tracker = %state.tracker_ident(),
                        stored = ?icon,
                        status = %state.dispatch_status(),
                        "snapshot_icon_mismatch"
                    );
                }
            }
        }

        Some(snapshot)
    }

    /// Read and restore the persisted fleet
    ///
    /// The restored ended log ids are kept for `ended_log_ids`.
    pub async fn load(&self) -> Vec<VehicleState> {
        match self.kv.get(&self.key).await {
            Ok(blob) => {
                let Some(snapshot) = Self::restore_snapshot(blob.as_deref()) else {
                    info!(vehicles = 0, "snapshot_restored");
                    return Vec::new();
                };
                info!(
                    vehicles = snapshot.vehicles.len(),
                    ended_log_ids = snapshot.ended_log_ids.len(),
                    "snapshot_restored"
                );
                self.set_ended_log_ids(snapshot.ended_log_ids);
                snapshot.vehicles
            }
            Err(e) => {
                warn!(error = %e, "snapshot_read_failed");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, states: &[VehicleState]) -> Result<()> {
        let mut snapshot = Self::snapshot(states);
        snapshot.ended_log_ids = self.ended_log_ids();
        let blob = Self::encode(&snapshot)?;
        self.kv.set(&self.key, &blob).await
    }

    /// Drop the persisted snapshot
    pub async fn invalidate(&self) -> Result<()> {
        self.kv.remove(&self.key).await
    }

    /// Write published snapshots in the background
    ///
    /// Bursts of updates within `debounce` collapse into one write of the
    /// latest snapshot. When `live` drops the stored snapshot is invalidated
    /// and writes are held until `live` returns. Pending changes are flushed
    /// on shutdown unless suspended.
    pub fn spawn_writer(
        self: Arc<Self>,
        mut snapshots: watch::Receiver<FleetSnapshot>,
        mut live: watch::Receiver<bool>,
        debounce: Duration,
        metrics: Arc<Metrics>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut suspended = false;
            let mut live_open = true;
            loop {
                tokio::select! {
                    changed = snapshots.changed(), if !suspended => {
                        if changed.is_err() {
                            debug!("snapshot_publisher_closed");
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(debounce) => {}
                            _ = shutdown.changed() => {}
                        }
                        let latest = snapshots.borrow_and_update().clone();
                        self.write(&latest, &metrics).await;
                        if *shutdown.borrow() || shutdown.has_changed().is_err() {
                            break;
                        }
                    }
                    res = live.changed(), if live_open => {
                        if res.is_err() {
                            live_open = false;
                            suspended = false;
                            continue;
                        }
                        let now_live = *live.borrow_and_update();
                        if !now_live && !suspended {
                            suspended = true;
                            match self.invalidate().await {
                                Ok(()) => debug!("snapshot_invalidated"),
                                Err(e) => warn!(error = %e, "snapshot_invalidate_failed"),
                            }
                        } else if now_live {
                            // Changes made while suspended are still unseen
                            suspended = false;
                        }
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            if !suspended && snapshots.has_changed().unwrap_or(false) {
                                let latest = snapshots.borrow_and_update().clone();
                                self.write(&latest, &metrics).await;
                            }
                            break;
                        }
                    }
                }
            }
            info!("persistence_writer_stopped");
        })
    }

    async fn write(&self, states: &[VehicleState], metrics: &Metrics) {
        match self.save(states).await {
            Ok(()) => {
                metrics.record_persistence_write(true);
                debug!(vehicles = states.len(), "snapshot_saved");
            }
            Err(e) => {
                metrics.record_persistence_write(false);
                warn!(error = %e, "snapshot_save_failed");
            }
        }
    }
}
