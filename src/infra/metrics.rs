//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Location updates applied to the store (monotonic)
    updates_accepted: AtomicU64,
    /// Location updates discarded as stale or duplicate (monotonic)
    updates_stale: AtomicU64,
    /// Location updates rejected: malformed, invalid or unknown bus (monotonic)
    updates_rejected: AtomicU64,
    /// Updates since last report (reset on report)
    updates_since_report: AtomicU64,
    /// Sum of ingest latencies in microseconds (reset on report)
    ingest_latency_sum_us: AtomicU64,
    /// Max ingest latency in microseconds (reset on report)
    ingest_latency_max_us: AtomicU64,
    /// Ingest latency histogram buckets (reset on report)
    ingest_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Status transitions applied (monotonic)
    transitions_applied: AtomicU64,
    /// Status transitions rejected by the state machine (monotonic)
    transitions_rejected: AtomicU64,
    /// Successful check-ins (monotonic)
    checkins_succeeded: AtomicU64,
    /// Failed check-ins of any cause (monotonic)
    checkins_failed: AtomicU64,
    /// Bus deltas queued to the fan-out engine (monotonic)
    broadcasts_published: AtomicU64,
    /// Bus deltas dropped because the fan-out queue was full (monotonic)
    broadcasts_queue_full: AtomicU64,
    /// Messages handed to subscriber channels (monotonic)
    deliveries_total: AtomicU64,
    /// Messages dropped for a slow subscriber (monotonic)
    deliveries_dropped: AtomicU64,
    /// Subscriptions registered (monotonic)
    subscribers_connected: AtomicU64,
    /// Subscriptions removed (monotonic)
    subscribers_disconnected: AtomicU64,
    /// Notifications delivered to at least one channel (monotonic)
    notifications_delivered: AtomicU64,
    /// Notifications held for a disconnected user (monotonic)
    notifications_retained: AtomicU64,
    /// Notifications dropped (monotonic)
    notifications_dropped: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            updates_accepted: AtomicU64::new(0),
            updates_stale: AtomicU64::new(0),
            updates_rejected: AtomicU64::new(0),
            updates_since_report: AtomicU64::new(0),
            ingest_latency_sum_us: AtomicU64::new(0),
            ingest_latency_max_us: AtomicU64::new(0),
            ingest_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            transitions_applied: AtomicU64::new(0),
            transitions_rejected: AtomicU64::new(0),
            checkins_succeeded: AtomicU64::new(0),
            checkins_failed: AtomicU64::new(0),
            broadcasts_published: AtomicU64::new(0),
            broadcasts_queue_full: AtomicU64::new(0),
            deliveries_total: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            subscribers_connected: AtomicU64::new(0),
            subscribers_disconnected: AtomicU64::new(0),
            notifications_delivered: AtomicU64::new(0),
            notifications_retained: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an accepted location update with its ingest latency (lock-free)
    #[inline]
    pub fn record_update_accepted(&self, latency_us: u64) {
        self.updates_accepted.fetch_add(1, Ordering::Relaxed);
        self.updates_since_report.fetch_add(1, Ordering::Relaxed);
        self.ingest_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        // Update histogram bucket
        let bucket = bucket_index(latency_us);
        self.ingest_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        // Update max
        update_atomic_max(&self.ingest_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_update_stale(&self) {
        self.updates_stale.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_update_rejected(&self) {
        self.updates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition(&self, applied: bool) {
        if applied {
            self.transitions_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transitions_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_checkin(&self, succeeded: bool) {
        if succeeded {
            self.checkins_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkins_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_broadcast_published(&self) {
        self.broadcasts_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_broadcast_queue_full(&self) {
        self.broadcasts_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery(&self, delivered: bool) {
        if delivered {
            self.deliveries_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_subscriber_connected(&self) {
        self.subscribers_connected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_disconnected(&self) {
        self.subscribers_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_delivered(&self) {
        self.notifications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_retained(&self) {
        self.notifications_retained.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn updates_accepted(&self) -> u64 {
        self.updates_accepted.load(Ordering::Relaxed)
    }

    pub fn updates_stale(&self) -> u64 {
        self.updates_stale.load(Ordering::Relaxed)
    }

    pub fn updates_rejected(&self) -> u64 {
        self.updates_rejected.load(Ordering::Relaxed)
    }

    pub fn checkins_succeeded(&self) -> u64 {
        self.checkins_succeeded.load(Ordering::Relaxed)
    }

    pub fn checkins_failed(&self) -> u64 {
        self.checkins_failed.load(Ordering::Relaxed)
    }

    pub fn deliveries_dropped(&self) -> u64 {
        self.deliveries_dropped.load(Ordering::Relaxed)
    }

    pub fn broadcasts_published(&self) -> u64 {
        self.broadcasts_published.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, buses: usize, subscribers: usize) -> MetricsSummary {
        // Swap periodic counters to zero and get their values
        let updates_count = self.updates_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.ingest_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.ingest_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.ingest_latency_buckets);

        // Calculate elapsed time and reset
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let updates_per_sec = if elapsed.as_secs_f64() > 0.0 {
            updates_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if updates_count > 0 { latency_sum / updates_count } else { 0 };

        MetricsSummary {
            updates_accepted: self.updates_accepted.load(Ordering::Relaxed),
            updates_stale: self.updates_stale.load(Ordering::Relaxed),
            updates_rejected: self.updates_rejected.load(Ordering::Relaxed),
            updates_per_sec,
            avg_ingest_latency_us: avg_latency,
            max_ingest_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
            transitions_applied: self.transitions_applied.load(Ordering::Relaxed),
            transitions_rejected: self.transitions_rejected.load(Ordering::Relaxed),
            checkins_succeeded: self.checkins_succeeded.load(Ordering::Relaxed),
            checkins_failed: self.checkins_failed.load(Ordering::Relaxed),
            broadcasts_published: self.broadcasts_published.load(Ordering::Relaxed),
            broadcasts_queue_full: self.broadcasts_queue_full.load(Ordering::Relaxed),
            deliveries_total: self.deliveries_total.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            subscribers_connected: self.subscribers_connected.load(Ordering::Relaxed),
            subscribers_disconnected: self.subscribers_disconnected.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            notifications_retained: self.notifications_retained.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            buses,
            subscribers,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub updates_accepted: u64,
    pub updates_stale: u64,
    pub updates_rejected: u64,
    pub updates_per_sec: f64,
    pub avg_ingest_latency_us: u64,
    pub max_ingest_latency_us: u64,
    /// Ingest latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub transitions_applied: u64,
    pub transitions_rejected: u64,
    pub checkins_succeeded: u64,
    pub checkins_failed: u64,
    pub broadcasts_published: u64,
    pub broadcasts_queue_full: u64,
    pub deliveries_total: u64,
    pub deliveries_dropped: u64,
    pub subscribers_connected: u64,
    pub subscribers_disconnected: u64,
    pub notifications_delivered: u64,
    pub notifications_retained: u64,
    pub notifications_dropped: u64,
    /// Registered buses (gauge)
    pub buses: usize,
    /// Live subscriptions (gauge)
    pub subscribers: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            updates_accepted = %self.updates_accepted,
            updates_stale = %self.updates_stale,
            updates_rejected = %self.updates_rejected,
            updates_per_sec = format!("{:.1}", self.updates_per_sec),
            avg_latency_us = %self.avg_ingest_latency_us,
            p99_us = %self.lat_p99_us,
            checkins = %self.checkins_succeeded,
            broadcasts = %self.broadcasts_published,
            deliveries_dropped = %self.deliveries_dropped,
            buses = %self.buses,
            subscribers = %self.subscribers,
            "metrics"
        );
    }
}
