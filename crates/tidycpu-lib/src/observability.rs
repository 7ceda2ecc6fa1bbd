//! Observability infrastructure for tidycpu runs
//!
//! Provides:
//! - Prometheus metrics (sample latency, core labels, inventory failures, actions)
//! - Structured logging of each run step with tracing

use crate::collector::UsageReport;
use crate::models::{CoreLabel, ExecutionOutcome, OutcomeStatus, QueryFailure};
use crate::planner::RebalancePlan;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Sampling windows range from tens of milliseconds to a few seconds
const SAMPLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.0, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<TidyMetricsInner> = OnceLock::new();

struct TidyMetricsInner {
    sample_duration_seconds: Histogram,
    logical_cores: IntGauge,
    cores_by_label: IntGaugeVec,
    query_failures: IntCounter,
    actions_planned: IntCounter,
    actions_applied: IntCounter,
    actions_manual: IntCounter,
    runs: IntCounterVec,
}

impl TidyMetricsInner {
    fn new() -> Self {
        Self {
            sample_duration_seconds: register_histogram!(
                "tidycpu_sample_duration_seconds",
                "Wall time of one two-read utilization sample",
                SAMPLE_BUCKETS.to_vec()
            )
            .expect("Failed to register sample_duration_seconds"),

            logical_cores: register_int_gauge!(
                "tidycpu_logical_cores",
                "Logical cores reported by the host topology"
            )
            .expect("Failed to register logical_cores"),

            cores_by_label: register_int_gauge_vec!(
                "tidycpu_cores",
                "Cores per utilization label in the latest sample",
                &["label"]
            )
            .expect("Failed to register cores"),

            query_failures: register_int_counter!(
                "tidycpu_affinity_query_failures_total",
                "Processes or threads whose affinity could not be read"
            )
            .expect("Failed to register affinity_query_failures_total"),

            actions_planned: register_int_counter!(
                "tidycpu_actions_planned_total",
                "Rebalance actions planned"
            )
            .expect("Failed to register actions_planned_total"),

            actions_applied: register_int_counter!(
                "tidycpu_actions_applied_total",
                "Rebalance actions applied and confirmed"
            )
            .expect("Failed to register actions_applied_total"),

            actions_manual: register_int_counter!(
                "tidycpu_actions_manual_total",
                "Rebalance actions left for manual application"
            )
            .expect("Failed to register actions_manual_total"),

            runs: register_int_counter_vec!(
                "tidycpu_runs_total",
                "Completed runs by final status",
                &["status"]
            )
            .expect("Failed to register runs_total"),
        }
    }
}

/// Handle to the process-wide metrics. Clones share the same metrics.
#[derive(Clone)]
pub struct TidyMetrics {
    _private: (),
}

impl Default for TidyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TidyMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TidyMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TidyMetricsInner {
        GLOBAL_METRICS.get_or_init(TidyMetricsInner::new)
    }

    pub fn observe_sample_duration(&self, duration_secs: f64) {
        self.inner().sample_duration_seconds.observe(duration_secs);
    }

    pub fn set_logical_cores(&self, count: usize) {
        self.inner().logical_cores.set(count as i64);
    }

    /// Record the label distribution of the latest sample
    pub fn set_core_labels(&self, report: &UsageReport) {
        for label in [CoreLabel::Hot, CoreLabel::Warm, CoreLabel::Cold] {
            self.inner()
                .cores_by_label
                .with_label_values(&[label.as_str()])
                .set(report.count(label) as i64);
        }
    }

    pub fn add_query_failures(&self, count: usize) {
        self.inner().query_failures.inc_by(count as u64);
    }

    pub fn add_actions_planned(&self, count: usize) {
        self.inner().actions_planned.inc_by(count as u64);
    }

    pub fn record_outcome(&self, outcome: &ExecutionOutcome) {
        if outcome.is_applied() {
            self.inner().actions_applied.inc();
        } else {
            self.inner().actions_manual.inc();
        }
    }

    pub fn inc_runs(&self, status: &str) {
        self.inner().runs.with_label_values(&[status]).inc();
    }

    /// Prometheus text exposition of everything registered
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Structured logger for run events, tagged with the host name
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new(local_hostname())
    }
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn log_run_started(&self, mode: &str, logical_cores: usize) {
        info!(
            event = "run_started",
            host = %self.host,
            mode = %mode,
            logical_cores = logical_cores,
            "Run started"
        );
    }

    pub fn log_usage_sampled(&self, report: &UsageReport) {
        info!(
            event = "usage_sampled",
            host = %self.host,
            cores = report.stats.len(),
            hot = report.count(CoreLabel::Hot),
            warm = report.count(CoreLabel::Warm),
            cold = report.count(CoreLabel::Cold),
            gaps = report.gaps.len(),
            interval_ms = report.interval_ms,
            "Per-core utilization sampled"
        );
    }

    pub fn log_query_failed(&self, failure: &QueryFailure) {
        debug!(
            event = "query_failed",
            host = %self.host,
            pid = failure.pid,
            tid = ?failure.tid,
            reason = %failure.reason,
            "Affinity query failed"
        );
    }

    pub fn log_plan_built(&self, plan: &RebalancePlan) {
        info!(
            event = "plan_built",
            host = %self.host,
            status = ?plan.status(),
            actions = plan.actions.len(),
            unplanned = plan.unplanned.len(),
            hot_cores = plan.hot_cores.len(),
            cold_cores = plan.cold_cores.len(),
            "Rebalance plan built"
        );
    }

    pub fn log_outcome(&self, outcome: &ExecutionOutcome) {
        match &outcome.status {
            OutcomeStatus::Applied { .. } => info!(
                event = "action_applied",
                host = %self.host,
                pid = outcome.pid,
                name = %outcome.name,
                to_cores = ?outcome.to_cores,
                "Affinity applied"
            ),
            OutcomeStatus::ManualOnly { reason } => warn!(
                event = "action_manual",
                host = %self.host,
                pid = outcome.pid,
                name = %outcome.name,
                to_cores = ?outcome.to_cores,
                reason = %reason,
                "Affinity not applied, manual action required"
            ),
        }
    }

    pub fn log_run_finished(&self, status: &str, actions: usize, applied: usize) {
        info!(
            event = "run_finished",
            host = %self.host,
            status = %status,
            actions = actions,
            applied = applied,
            "Run finished"
        );
    }
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
