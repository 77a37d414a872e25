//! Observability infrastructure for the repacker
//!
//! Provides:
//! - Prometheus metrics (calculation latency, migration runs, eviction
//!   counters, in-flight eviction gauge)
//! - Structured JSON logging with tracing

use prometheus::{register_histogram, register_int_gauge, Histogram, IntGauge};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for calculation latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RepackerMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct RepackerMetricsInner {
    calculation_latency_seconds: Histogram,
    plans_computed: IntGauge,
    plan_entries: IntGauge,
    calculation_errors: IntGauge,
    migration_runs: IntGauge,
    evictions_total: IntGauge,
    eviction_retries: IntGauge,
    eviction_failures: IntGauge,
    inflight_evictions: IntGauge,
    extender_requests: IntGauge,
}

impl RepackerMetricsInner {
    fn new() -> Self {
        Self {
            calculation_latency_seconds: register_histogram!(
                "repacker_calculation_latency_seconds",
                "Time spent building, submitting and validating one optimization cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register calculation_latency_seconds"),

            plans_computed: register_int_gauge!(
                "repacker_plans_computed_total",
                "Total number of migration plans successfully computed"
            )
            .expect("Failed to register plans_computed"),

            plan_entries: register_int_gauge!(
                "repacker_plan_entries",
                "Number of entries in the currently stored migration plan"
            )
            .expect("Failed to register plan_entries"),

            calculation_errors: register_int_gauge!(
                "repacker_calculation_errors_total",
                "Total number of skipped or failed calculation cycles"
            )
            .expect("Failed to register calculation_errors"),

            migration_runs: register_int_gauge!(
                "repacker_migration_runs_total",
                "Total number of migration runs started"
            )
            .expect("Failed to register migration_runs"),

            evictions_total: register_int_gauge!(
                "repacker_evictions_total",
                "Total number of pods evicted with deletion confirmed"
            )
            .expect("Failed to register evictions_total"),

            eviction_retries: register_int_gauge!(
                "repacker_eviction_retries_total",
                "Total eviction attempts blocked by a disruption budget"
            )
            .expect("Failed to register eviction_retries"),

            eviction_failures: register_int_gauge!(
                "repacker_eviction_failures_total",
                "Total evictions failed with a non-budget error"
            )
            .expect("Failed to register eviction_failures"),

            inflight_evictions: register_int_gauge!(
                "repacker_inflight_evictions",
                "Pod evictions currently holding a concurrency slot"
            )
            .expect("Failed to register inflight_evictions"),

            extender_requests: register_int_gauge!(
                "repacker_extender_requests_total",
                "Total scheduler-extender requests handled"
            )
            .expect("Failed to register extender_requests"),
        }
    }
}

/// Repacker metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct RepackerMetrics {
    _private: (),
}

impl Default for RepackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RepackerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RepackerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RepackerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_calculation_latency(&self, duration_secs: f64) {
        self.inner()
            .calculation_latency_seconds
            .observe(duration_secs);
    }

    pub fn inc_plans_computed(&self) {
        self.inner().plans_computed.inc();
    }

    pub fn set_plan_entries(&self, count: i64) {
        self.inner().plan_entries.set(count);
    }

    pub fn inc_calculation_errors(&self) {
        self.inner().calculation_errors.inc();
    }

    pub fn inc_migration_runs(&self) {
        self.inner().migration_runs.inc();
    }

    pub fn inc_evictions(&self) {
        self.inner().evictions_total.inc();
    }

    pub fn inc_eviction_retries(&self) {
        self.inner().eviction_retries.inc();
    }

    pub fn inc_eviction_failures(&self) {
        self.inner().eviction_failures.inc();
    }

    pub fn inc_inflight_evictions(&self) {
        self.inner().inflight_evictions.inc();
    }

    pub fn dec_inflight_evictions(&self) {
        self.inner().inflight_evictions.dec();
    }

    pub fn inc_extender_requests(&self) {
        self.inner().extender_requests.inc();
    }
}

/// Structured logger for repacker lifecycle events
///
/// Consistent JSON-formatted logging for calculations, migration runs
/// and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster_name: String,
}

impl StructuredLogger {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
        }
    }

    /// Log process startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "repacker_started",
            cluster = %self.cluster_name,
            version = %version,
            "Cluster repacker started"
        );
    }

    /// Log process shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "repacker_shutdown",
            cluster = %self.cluster_name,
            reason = %reason,
            "Cluster repacker shutting down"
        );
    }

    /// Log a successful plan calculation
    pub fn log_plan_computed(&self, entries: usize, computed_at: i64) {
        info!(
            event = "plan_computed",
            cluster = %self.cluster_name,
            entries = entries,
            computed_at = computed_at,
            "Migration plan computed"
        );
    }

    /// Log a skipped or failed calculation cycle
    ///
    /// This log line is the operator-visible audit trail for skipped
    /// cycles; the previous plan stays in effect.
    pub fn log_calculation_skipped(&self, reason: &str) {
        warn!(
            event = "calculation_skipped",
            cluster = %self.cluster_name,
            reason = %reason,
            "Calculation cycle skipped, previous plan retained"
        );
    }

    /// Log the start of a migration run
    pub fn log_migration_run(&self, trace_id: &str, nodes: usize, entries: usize) {
        info!(
            event = "migration_run",
            cluster = %self.cluster_name,
            trace_id = %trace_id,
            nodes = nodes,
            entries = entries,
            "Migration run started"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_handle_is_cloneable_and_shared() {
        let a = RepackerMetrics::new();
        let b = a.clone();
        a.inc_plans_computed();
        b.inc_plans_computed();
        a.set_plan_entries(7);
        a.observe_calculation_latency(0.5);
    }

    #[test]
    fn inflight_gauge_moves_both_ways() {
        let metrics = RepackerMetrics::new();
        metrics.inc_inflight_evictions();
        metrics.inc_inflight_evictions();
        metrics.dec_inflight_evictions();
        metrics.dec_inflight_evictions();
    }

    #[test]
    fn structured_logger_creation() {
        let logger = StructuredLogger::new("test-cluster");
        assert_eq!(logger.cluster_name, "test-cluster");
    }
}
