//! Manual refresh: suspend live processing, refetch the roster, resume
//!
//! Lifecycle: `Idle -> Fetching -> Settling -> Idle`. Requests arriving in
//! any non-idle phase join the running refresh and receive its result.
//! While not idle, `is_live()` is false and the engine drops inbound records.

use crate::domain::roster::FleetRoster;
use crate::io::api::{ApiSet, DispatchApi};
use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefreshError {
    #[error("roster fetch failed: {0}")]
    Fetch(String),
    #[error("dispatch engine is not running")]
    EngineUnavailable,
}

/// Result handed to every caller of one refresh
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshSummary {
    pub buses: usize,
    pub active_dispatches: usize,
}

impl RefreshSummary {
    pub fn for_roster(roster: &FleetRoster) -> Self {
        Self {
            buses: roster.len(),
            active_dispatches: roster.buses().iter().filter(|b| b.dispatch_log_id.is_some()).count(),
        }
    }
}

pub type RefreshReply = oneshot::Sender<Result<RefreshSummary, RefreshError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Fetching,
    Settling,
}

pub struct RefreshController {
    phase: RefreshPhase,
    waiters: Vec<RefreshReply>,
    pending: Option<RefreshSummary>,
    settle_delay: Duration,
    live: watch::Sender<bool>,
}

impl RefreshController {
    pub fn new(settle_delay: Duration) -> Self {
        let (live, _) = watch::channel(true);
        Self { phase: RefreshPhase::Idle, waiters: Vec::new(), pending: None, settle_delay, live }
    }

    pub fn phase(&self) -> RefreshPhase {
        self.phase
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    pub fn subscribe_live(&self) -> watch::Receiver<bool> {
        self.live.subscribe()
    }

    /// Register a request; returns true if the caller must start the fetch
    pub fn request(&mut self, reply: RefreshReply) -> bool {
        self.waiters.push(reply);
        if self.phase != RefreshPhase::Idle {
            info!(waiters = self.waiters.len(), "refresh_coalesced");
            return false;
        }
        self.phase = RefreshPhase::Fetching;
        self.live.send_replace(false);
        info!("refresh_started");
        true
    }

    /// Fetch succeeded; hold the result until the settle delay passes
    pub fn fetched(&mut self, summary: RefreshSummary) {
        self.phase = RefreshPhase::Settling;
        self.pending = Some(summary);
    }

    /// Fetch failed; resume at once and fail every waiter
    pub fn failed(&mut self, error: RefreshError) {
        warn!(error = %error, "refresh_failed");
        self.finish(Err(error));
    }

    /// Settle delay elapsed; resume and answer every waiter
    pub fn settled(&mut self) {
        if self.phase != RefreshPhase::Settling {
            return;
        }
        let summary = self.pending.take().unwrap_or(RefreshSummary { buses: 0, active_dispatches: 0 });
        info!(buses = summary.buses, active = summary.active_dispatches, "refresh_completed");
        self.finish(Ok(summary));
    }

    fn finish(&mut self, result: Result<RefreshSummary, RefreshError>) {
        self.phase = RefreshPhase::Idle;
        self.pending = None;
        self.live.send_replace(true);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Fetch assignments and dispatch logs and join them into a roster
pub async fn fetch_roster(api: &dyn DispatchApi) -> anyhow::Result<FleetRoster> {
    let (assignments, dispatches) =
        tokio::try_join!(api.get_vehicle_assignments(), api.get_all_dispatches())
            .context("Failed to fetch roster")?;
    Ok(FleetRoster::build(assignments, &dispatches, Utc::now()))
}

/// Reset blocked locations, then fetch the roster
///
/// A failed reset is logged and does not stop the refresh.
pub async fn reset_and_fetch(apis: &ApiSet) -> anyhow::Result<FleetRoster> {
    if let Err(e) = apis.locations.reset_blocked_locations().await {
        warn!(error = %format!("{e:#}"), "blocked_locations_reset_failed");
    }
    fetch_roster(apis.dispatch.as_ref()).await
}
