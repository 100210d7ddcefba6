//! Backtest Harness
//!
//! Schedules one stub backtest per symbol/strategy combination, runs the
//! scheduler until every job settles or the ceiling is reached, then
//! reports each job's final status.

use backtest_orchestrator::config::{self, SchedulerConfig};
use backtest_orchestrator::core::BacktestScheduler;
use backtest_orchestrator::jobs::{ExecutorError, FnExecutor};
use backtest_orchestrator::logging;
use backtest_orchestrator::metrics::Metrics;
use backtest_orchestrator::models::{Job, JobRequest, JobResult};
use chrono::{Duration as ChronoDuration, Utc};
use dotenvy::dotenv;
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::Instant;
use tracing::{debug, info, warn};

fn env_list(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn stub_backtest(job: Job, work: Duration) -> Result<JobResult, ExecutorError> {
    tokio::time::sleep(work).await;
    let mut metrics = HashMap::new();
    metrics.insert("symbol".to_string(), json!(job.symbol));
    metrics.insert("strategy".to_string(), json!(job.strategy));
    metrics.insert("simulated_days".to_string(), json!((job.end_date - job.start_date).num_days()));
    Ok(JobResult::success(metrics))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env if present
    dotenv().ok();

    logging::init_logging();

    let environment = config::get_environment();
    info!("Starting Backtest Harness");
    info!(environment = %environment, "Environment");

    let symbols = env_list("SYMBOLS", "BTC,ETH");
    let strategies = env_list("STRATEGIES", "momentum,mean_reversion");
    if symbols.is_empty() || strategies.is_empty() {
        return Err("SYMBOLS and STRATEGIES must each name at least one entry".into());
    }
    let work = Duration::from_millis(env_u64("JOB_DURATION_MS", 2000));
    let ceiling = Duration::from_secs(env_u64("HARNESS_CEILING_SECS", 60));
    let poll_interval = Duration::from_millis(env_u64("HARNESS_POLL_MS", 500));

    let scheduler_config = SchedulerConfig::from_env();
    info!(
        symbols = ?symbols,
        strategies = ?strategies,
        max_concurrent_jobs = scheduler_config.max_concurrent_jobs,
        "Scheduling {} jobs",
        symbols.len() * strategies.len()
    );

    let metrics = Arc::new(Metrics::new()?);
    let executor = Arc::new(FnExecutor::new(move |job: Job| stub_backtest(job, work)));
    let scheduler =
        BacktestScheduler::open(scheduler_config, executor, Some(metrics.clone())).await?;

    let end = Utc::now().date_naive();
    let start = end - ChronoDuration::days(30);
    let mut requests = Vec::new();
    for symbol in &symbols {
        for strategy in &strategies {
            requests.push(JobRequest::new(symbol.clone(), strategy.clone(), start, end));
        }
    }
    let job_ids = scheduler.schedule_jobs(requests).await?;

    scheduler.start().await?;
    info!(ceiling_secs = ceiling.as_secs(), "Harness running, waiting for jobs...");

    let deadline = Instant::now() + ceiling;
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!("Interrupted, stopping early");
                break;
            }
            _ = ticker.tick() => {
                let status = scheduler.get_queue_status();
                info!(
                    queued = status.queue_size,
                    running = status.running_jobs,
                    completed = status.statistics.jobs_completed,
                    failed = status.statistics.jobs_failed,
                    "Progress"
                );
                let settled = job_ids.iter().all(|id| {
                    scheduler
                        .get_job_status(id)
                        .map(|s| s.is_terminal())
                        .unwrap_or(true)
                });
                if settled {
                    info!("All jobs settled");
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("Ceiling reached before all jobs settled");
                    break;
                }
            }
        }
    }

    scheduler.stop().await;

    for id in &job_ids {
        if let Some(job) = scheduler.get_job(id) {
            let duration = job
                .execution_duration()
                .map(|d| format!("{:.2}s", d.as_secs_f64()))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{}  {:<8} {:<16} {:<10} attempts={} duration={}",
                job.id,
                job.symbol,
                job.strategy,
                job.status.to_string(),
                job.retry_count + 1,
                duration
            );
        }
    }

    let status = scheduler.get_queue_status();
    println!(
        "completed={} failed={} cancelled={} avg_execution={:.2}s",
        status.statistics.jobs_completed,
        status.statistics.jobs_failed,
        status.statistics.jobs_cancelled,
        status.average_execution_time
    );

    match metrics.export() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => warn!(error = %e, "Failed to export metrics"),
    }

    Ok(())
}
