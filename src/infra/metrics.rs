//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Reporting is the only operation that resets anything (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only and must not be used for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// API call latency bucket boundaries (milliseconds)
const API_BUCKET_BOUNDS: [u64; 10] = [10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn api_bucket_index(latency_ms: u64) -> usize {
    API_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], bounds: &[u64; 10], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // Overflow bucket reports twice the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Total records processed by the engine (monotonic)
    events_total: AtomicU64,
    /// Records since last report (reset on report)
    events_since_report: AtomicU64,
    /// Sum of processing latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max processing latency (reset on report)
    latency_max_us: AtomicU64,
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Records the normalizer rejected (monotonic)
    events_rejected: AtomicU64,
    /// Records dropped while a refresh had processing suspended (monotonic)
    events_dropped_suspended: AtomicU64,
    /// Records dropped by the transport because the channel was full (monotonic)
    transport_events_dropped: AtomicU64,
    /// Dispatch, overspeed and location API calls (monotonic)
    api_calls_total: AtomicU64,
    api_failures_total: AtomicU64,
    api_calls_since_report: AtomicU64,
    api_latency_sum_ms: AtomicU64,
    api_latency_max_ms: AtomicU64,
    api_latency_buckets: [AtomicU64; NUM_BUCKETS],
    zone_arrivals: AtomicU64,
    auto_completions: AtomicU64,
    overspeed_incidents: AtomicU64,
    persistence_writes: AtomicU64,
    persistence_failures: AtomicU64,
    refreshes_total: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            events_rejected: AtomicU64::new(0),
            events_dropped_suspended: AtomicU64::new(0),
            transport_events_dropped: AtomicU64::new(0),
            api_calls_total: AtomicU64::new(0),
            api_failures_total: AtomicU64::new(0),
            api_calls_since_report: AtomicU64::new(0),
            api_latency_sum_ms: AtomicU64::new(0),
            api_latency_max_ms: AtomicU64::new(0),
            api_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            zone_arrivals: AtomicU64::new(0),
            auto_completions: AtomicU64::new(0),
            overspeed_incidents: AtomicU64::new(0),
            persistence_writes: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            refreshes_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a record was processed with given latency (lock-free)
    #[inline]
    pub fn record_event_processed(&self, latency_us: u64) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_event_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped_suspended(&self) {
        self.events_dropped_suspended.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transport_event_dropped(&self) {
        self.transport_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed API call and its latency in milliseconds
    #[inline]
    pub fn record_api_call(&self, latency_ms: u64, ok: bool) {
        self.api_calls_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.api_failures_total.fetch_add(1, Ordering::Relaxed);
        }
        self.api_calls_since_report.fetch_add(1, Ordering::Relaxed);
        self.api_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.api_latency_buckets[api_bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.api_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_zone_arrival(&self) {
        self.zone_arrivals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auto_completion(&self) {
        self.auto_completions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overspeed(&self) {
        self.overspeed_incidents.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_persistence_write(&self, ok: bool) {
        if ok {
            self.persistence_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_refresh(&self) {
        self.refreshes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn events_rejected(&self) -> u64 {
        self.events_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn events_dropped_suspended(&self) -> u64 {
        self.events_dropped_suspended.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn transport_events_dropped(&self) -> u64 {
        self.transport_events_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn api_failures_total(&self) -> u64 {
        self.api_failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn auto_completions(&self) -> u64 {
        self.auto_completions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn overspeed_incidents(&self) -> u64 {
        self.overspeed_incidents.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self, vehicles: usize, active_dispatches: usize) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let api_count = self.api_calls_since_report.swap(0, Ordering::Relaxed);
        let api_latency_sum = self.api_latency_sum_ms.swap(0, Ordering::Relaxed);
        let api_max_latency = self.api_latency_max_ms.swap(0, Ordering::Relaxed);
        let api_lat_buckets = swap_buckets(&self.api_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_per_sec,
            avg_process_latency_us: if events_count > 0 { latency_sum / events_count } else { 0 },
            max_process_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, &BUCKET_BOUNDS, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, &BUCKET_BOUNDS, 0.99),
            lat_buckets,
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            events_dropped_suspended: self.events_dropped_suspended.load(Ordering::Relaxed),
            transport_events_dropped: self.transport_events_dropped.load(Ordering::Relaxed),
            api_calls_total: self.api_calls_total.load(Ordering::Relaxed),
            api_failures_total: self.api_failures_total.load(Ordering::Relaxed),
            api_lat_avg_ms: if api_count > 0 { api_latency_sum / api_count } else { 0 },
            api_lat_max_ms: api_max_latency,
            api_lat_p99_ms: percentile_from_buckets(&api_lat_buckets, &API_BUCKET_BOUNDS, 0.99),
            zone_arrivals: self.zone_arrivals.load(Ordering::Relaxed),
            auto_completions: self.auto_completions.load(Ordering::Relaxed),
            overspeed_incidents: self.overspeed_incidents.load(Ordering::Relaxed),
            persistence_writes: self.persistence_writes.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            refreshes_total: self.refreshes_total.load(Ordering::Relaxed),
            vehicles,
            active_dispatches,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub events_total: u64,
    pub events_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub events_rejected: u64,
    pub events_dropped_suspended: u64,
    pub transport_events_dropped: u64,
    pub api_calls_total: u64,
    pub api_failures_total: u64,
    pub api_lat_avg_ms: u64,
    pub api_lat_max_ms: u64,
    pub api_lat_p99_ms: u64,
    pub zone_arrivals: u64,
    pub auto_completions: u64,
    pub overspeed_incidents: u64,
    pub persistence_writes: u64,
    pub persistence_failures: u64,
    pub refreshes_total: u64,
    /// Vehicles in the state store (snapshot)
    pub vehicles: usize,
    /// Vehicles on alley or on road (snapshot)
    pub active_dispatches: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_total = %self.events_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            p50_us = %self.lat_p50_us,
            p99_us = %self.lat_p99_us,
            rejected = %self.events_rejected,
            dropped_suspended = %self.events_dropped_suspended,
            dropped_transport = %self.transport_events_dropped,
            api_calls = %self.api_calls_total,
            api_failures = %self.api_failures_total,
            api_p99_ms = %self.api_lat_p99_ms,
            arrivals = %self.zone_arrivals,
            auto_completions = %self.auto_completions,
            overspeed = %self.overspeed_incidents,
            vehicles = %self.vehicles,
            active_dispatches = %self.active_dispatches,
            "metrics"
        );
    }
}
