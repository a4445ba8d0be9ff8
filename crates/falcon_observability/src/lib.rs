//! Observability setup: structured logging and Prometheus metrics for the
//! schema-change controller.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,falcon=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Initialize Prometheus metrics exporter.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

// ---------------------------------------------------------------------------
// DDL job metrics
// ---------------------------------------------------------------------------

/// Record a job accepted into the queue.
pub fn record_ddl_job_submitted(action: &str) {
    metrics::counter!("falcon_ddl_jobs_submitted_total", "action" => action.to_string())
        .increment(1);
}

/// Record one executed state-machine step.
/// `outcome` is one of "continue", "cancelled", "retry".
pub fn record_ddl_step(action: &str, schema_state: &str, outcome: &str) {
    metrics::counter!(
        "falcon_ddl_steps_total",
        "action" => action.to_string(),
        "state" => schema_state.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the duration of a single step in microseconds.
pub fn record_ddl_step_duration_us(action: &str, duration_us: u64) {
    metrics::histogram!("falcon_ddl_step_duration_us", "action" => action.to_string())
        .record(duration_us as f64);
}

/// Record a job reaching a terminal state ("done", "rollback done", "cancelled").
pub fn record_ddl_job_finished(action: &str, state: &str) {
    metrics::counter!(
        "falcon_ddl_jobs_finished_total",
        "action" => action.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record a rollback converter decision ("cancelled", "rolled_back", "refused").
pub fn record_ddl_rollback_decision(action: &str, decision: &str) {
    metrics::counter!(
        "falcon_ddl_rollback_decisions_total",
        "action" => action.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Record the schema version currently loaded by this node.
pub fn record_schema_version(version: u64) {
    metrics::gauge!("falcon_schema_version").set(version as f64);
}

/// Record whether this node currently holds DDL ownership.
pub fn record_ddl_owner(is_owner: bool) {
    metrics::gauge!("falcon_ddl_is_owner").set(if is_owner { 1.0 } else { 0.0 });
    if is_owner {
        metrics::counter!("falcon_ddl_owner_acquired_total").increment(1);
    }
}

/// Record the number of jobs currently held by workers.
pub fn record_ddl_running_jobs(count: usize) {
    metrics::gauge!("falcon_ddl_running_jobs").set(count as f64);
}
