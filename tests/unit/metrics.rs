//! Unit tests for the Prometheus registry

use backtest_orchestrator::metrics::Metrics;

#[test]
fn test_metrics_export_contains_registered_series() {
    let metrics = Metrics::new().expect("metrics initialization");
    metrics.jobs_scheduled_total.inc();
    metrics.jobs_running.set(2);
    metrics.job_execution_duration_seconds.observe(1.5);

    let output = metrics.export().expect("export metrics");
    assert!(output.contains("jobs_scheduled_total 1"));
    assert!(output.contains("jobs_running 2"));
    assert!(output.contains("job_execution_duration_seconds_count 1"));
    assert!(output.contains("bridge_sessions_active"));
}
