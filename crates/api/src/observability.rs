use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use fiscalis_domain::aggregation::AggregationReport;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const HTTP_REQUESTS_TOTAL: &str = "fiscalis_api_http_requests_total";
const HTTP_REQUEST_DURATION_SECONDS: &str = "fiscalis_api_http_request_duration_seconds";
const HTTP_REQUEST_ERRORS_TOTAL: &str = "fiscalis_api_http_errors_total";
const DUPLICATE_VERDICTS_TOTAL: &str = "fiscalis_api_duplicate_verdicts_total";
const AGGREGATION_RUNS_TOTAL: &str = "fiscalis_api_aggregation_runs_total";
const AGGREGATION_PARENTS_TOTAL: &str = "fiscalis_api_aggregation_parents_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_http_request(method: &str, route: &str, status: StatusCode, elapsed: Duration) {
    let status_code = status.as_u16().to_string();
    let result = if status.is_server_error() {
        "error"
    } else {
        "success"
    };

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone(),
        "result" => result
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone()
    )
    .record(elapsed.as_secs_f64());

    if status.is_server_error() {
        counter!(
            HTTP_REQUEST_ERRORS_TOTAL,
            "method" => method.to_string(),
            "route" => route.to_string(),
            "status" => status_code
        )
        .increment(1);
    }
}

pub fn register_duplicate_verdict(check: &str, is_duplicate: bool) {
    let verdict = if is_duplicate { "duplicate" } else { "clear" };
    counter!(
        DUPLICATE_VERDICTS_TOTAL,
        "check" => check.to_string(),
        "verdict" => verdict
    )
    .increment(1);
}

pub fn register_aggregation_run(trigger: &str, report: &AggregationReport) {
    counter!(AGGREGATION_RUNS_TOTAL, "trigger" => trigger.to_string()).increment(1);
    counter!(AGGREGATION_PARENTS_TOTAL, "outcome" => "created")
        .increment(report.parents_created as u64);
    counter!(AGGREGATION_PARENTS_TOTAL, "outcome" => "extended")
        .increment(report.parents_extended as u64);
}
