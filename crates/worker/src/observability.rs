use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use fiscalis_domain::aggregation::AggregationReport;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const SWEEPS_TOTAL: &str = "fiscalis_worker_sweeps_total";
const SWEEP_DURATION_MS: &str = "fiscalis_worker_sweep_duration_ms";
const PARENTS_TOTAL: &str = "fiscalis_worker_parents_total";
const CHILDREN_LINKED_TOTAL: &str = "fiscalis_worker_children_linked_total";
const GROUPS_SKIPPED_TOTAL: &str = "fiscalis_worker_groups_skipped_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn register_sweep(result: &str, report: &AggregationReport, elapsed: Duration) {
    counter!(SWEEPS_TOTAL, "result" => result.to_string()).increment(1);
    histogram!(SWEEP_DURATION_MS, "result" => result.to_string())
        .record(elapsed.as_millis() as f64);

    counter!(PARENTS_TOTAL, "outcome" => "created").increment(report.parents_created as u64);
    counter!(PARENTS_TOTAL, "outcome" => "extended").increment(report.parents_extended as u64);
    counter!(CHILDREN_LINKED_TOTAL).increment(report.children_linked as u64);
    counter!(GROUPS_SKIPPED_TOTAL).increment(report.groups_skipped as u64);
}

pub fn register_sweep_failure(elapsed: Duration) {
    counter!(SWEEPS_TOTAL, "result" => "error").increment(1);
    histogram!(SWEEP_DURATION_MS, "result" => "error").record(elapsed.as_millis() as f64);
}
