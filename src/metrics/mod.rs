//! Prometheus metrics for scheduling and bridge activity

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub jobs_scheduled_total: IntCounter,
    pub jobs_completed_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub jobs_cancelled_total: IntCounter,
    pub jobs_retried_total: IntCounter,
    pub jobs_running: IntGauge,
    pub jobs_queued: IntGauge,
    pub job_execution_duration_seconds: Histogram,
    pub bridge_sessions_active: IntGauge,
    pub bridge_bars_forwarded_total: IntCounter,
    pub bridge_signals_received_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_scheduled_total =
            IntCounter::new("jobs_scheduled_total", "Jobs accepted by the scheduler")?;
        let jobs_completed_total =
            IntCounter::new("jobs_completed_total", "Jobs that finished successfully")?;
        let jobs_failed_total = IntCounter::new(
            "jobs_failed_total",
            "Jobs that failed permanently after exhausting retries",
        )?;
        let jobs_cancelled_total =
            IntCounter::new("jobs_cancelled_total", "Jobs cancelled before running")?;
        let jobs_retried_total =
            IntCounter::new("jobs_retried_total", "Failed attempts that were re-enqueued")?;
        let jobs_running = IntGauge::new("jobs_running", "Jobs currently executing")?;
        let jobs_queued = IntGauge::new("jobs_queued", "Jobs waiting in the priority queue")?;
        let job_execution_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "job_execution_duration_seconds",
                "Wall-clock duration of completed job executions",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        )?;
        let bridge_sessions_active =
            IntGauge::new("bridge_sessions_active", "Strategy bridge sessions alive")?;
        let bridge_bars_forwarded_total = IntCounter::new(
            "bridge_bars_forwarded_total",
            "Market data bars published to strategy processes",
        )?;
        let bridge_signals_received_total = IntCounter::new(
            "bridge_signals_received_total",
            "Signals received from strategy processes",
        )?;

        registry.register(Box::new(jobs_scheduled_total.clone()))?;
        registry.register(Box::new(jobs_completed_total.clone()))?;
        registry.register(Box::new(jobs_failed_total.clone()))?;
        registry.register(Box::new(jobs_cancelled_total.clone()))?;
        registry.register(Box::new(jobs_retried_total.clone()))?;
        registry.register(Box::new(jobs_running.clone()))?;
        registry.register(Box::new(jobs_queued.clone()))?;
        registry.register(Box::new(job_execution_duration_seconds.clone()))?;
        registry.register(Box::new(bridge_sessions_active.clone()))?;
        registry.register(Box::new(bridge_bars_forwarded_total.clone()))?;
        registry.register(Box::new(bridge_signals_received_total.clone()))?;

        Ok(Self {
            registry,
            jobs_scheduled_total,
            jobs_completed_total,
            jobs_failed_total,
            jobs_cancelled_total,
            jobs_retried_total,
            jobs_running,
            jobs_queued,
            job_execution_duration_seconds,
            bridge_sessions_active,
            bridge_bars_forwarded_total,
            bridge_signals_received_total,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
