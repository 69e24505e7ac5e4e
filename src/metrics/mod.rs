//! Process-wide counters for quota synchronization.
//!
//! All counters are lock-free atomics; `snapshot()` gives a consistent-enough
//! view for logging at shutdown or exposing through a host's own tooling.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

/// Relaxed ordering for counters (eventual visibility is fine for metrics).
const RELAXED: Ordering = Ordering::Relaxed;

/// Collection of all engine counters.
pub struct Metrics {
    // Event intake
    pub events_received: AtomicU64,
    pub events_ignored: AtomicU64,
    pub triggers_coalesced: AtomicU64,
    pub requests_dropped: AtomicU64,

    // Reconciliation outcomes
    pub reconciliations_applied: AtomicU64,
    pub reconciliations_unchanged: AtomicU64,
    pub reconciliations_failed: AtomicU64,
    pub node_write_retries: AtomicU64,

    // Group fan-out
    pub fanout_runs: AtomicU64,
    pub fanout_users: AtomicU64,

    // Ledger
    pub ledger_writes: AtomicU64,
    pub ledger_write_failures: AtomicU64,
    pub ledger_records_skipped: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    pub const fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_ignored: AtomicU64::new(0),
            triggers_coalesced: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),

            reconciliations_applied: AtomicU64::new(0),
            reconciliations_unchanged: AtomicU64::new(0),
            reconciliations_failed: AtomicU64::new(0),
            node_write_retries: AtomicU64::new(0),

            fanout_runs: AtomicU64::new(0),
            fanout_users: AtomicU64::new(0),

            ledger_writes: AtomicU64::new(0),
            ledger_write_failures: AtomicU64::new(0),
            ledger_records_skipped: AtomicU64::new(0),
        }
    }

    /// Increment a counter.
    #[inline]
    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, RELAXED);
    }

    /// Add to a counter.
    #[inline]
    pub fn add(&self, counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, RELAXED);
    }

    /// Get counter value.
    #[inline]
    pub fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(RELAXED)
    }

    /// Get a snapshot of all metrics for reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.load(RELAXED),
            events_ignored: self.events_ignored.load(RELAXED),
            triggers_coalesced: self.triggers_coalesced.load(RELAXED),
            requests_dropped: self.requests_dropped.load(RELAXED),

            reconciliations_applied: self.reconciliations_applied.load(RELAXED),
            reconciliations_unchanged: self.reconciliations_unchanged.load(RELAXED),
            reconciliations_failed: self.reconciliations_failed.load(RELAXED),
            node_write_retries: self.node_write_retries.load(RELAXED),

            fanout_runs: self.fanout_runs.load(RELAXED),
            fanout_users: self.fanout_users.load(RELAXED),

            ledger_writes: self.ledger_writes.load(RELAXED),
            ledger_write_failures: self.ledger_write_failures.load(RELAXED),
            ledger_records_skipped: self.ledger_records_skipped.load(RELAXED),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_ignored: u64,
    pub triggers_coalesced: u64,
    pub requests_dropped: u64,

    pub reconciliations_applied: u64,
    pub reconciliations_unchanged: u64,
    pub reconciliations_failed: u64,
    pub node_write_retries: u64,

    pub fanout_runs: u64,
    pub fanout_users: u64,

    pub ledger_writes: u64,
    pub ledger_write_failures: u64,
    pub ledger_records_skipped: u64,
}

impl MetricsSnapshot {
    /// Format as `name:value` lines grouped by section.
    pub fn to_info_string(&self) -> String {
        let mut out = String::with_capacity(512);

        out.push_str("# Events\n");
        out.push_str(&format!("events_received:{}\n", self.events_received));
        out.push_str(&format!("events_ignored:{}\n", self.events_ignored));
        out.push_str(&format!("triggers_coalesced:{}\n", self.triggers_coalesced));
        out.push_str(&format!("requests_dropped:{}\n", self.requests_dropped));
        out.push('\n');

        out.push_str("# Reconciliation\n");
        out.push_str(&format!(
            "reconciliations_applied:{}\n",
            self.reconciliations_applied
        ));
        out.push_str(&format!(
            "reconciliations_unchanged:{}\n",
            self.reconciliations_unchanged
        ));
        out.push_str(&format!(
            "reconciliations_failed:{}\n",
            self.reconciliations_failed
        ));
        out.push_str(&format!("node_write_retries:{}\n", self.node_write_retries));
        out.push_str(&format!("fanout_runs:{}\n", self.fanout_runs));
        out.push_str(&format!("fanout_users:{}\n", self.fanout_users));
        out.push('\n');

        out.push_str("# Ledger\n");
        out.push_str(&format!("ledger_writes:{}\n", self.ledger_writes));
        out.push_str(&format!(
            "ledger_write_failures:{}\n",
            self.ledger_write_failures
        ));
        out.push_str(&format!(
            "ledger_records_skipped:{}\n",
            self.ledger_records_skipped
        ));

        out
    }
}
