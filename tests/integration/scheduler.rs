//! Integration tests for the backtest scheduler
//!
//! Covers dispatch under a concurrency limit, priority order, retries,
//! cancellation, deferred start and persistence.


use backtest_orchestrator::core::{BacktestScheduler, SchedulerError};
use backtest_orchestrator::jobs::JobStore;
use backtest_orchestrator::metrics::Metrics;
use backtest_orchestrator::models::{JobPriority, JobStatus};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::Instant;

use test_utils::{fast_config, request, wait_for_status, Behavior, RecordingExecutor};

#[tokio::test]
async fn scenario_a_four_jobs_two_slots_complete_in_two_rounds() {
    let executor = Arc::new(RecordingExecutor::new(
        Behavior::Succeed,
        Duration::from_millis(200),
    ));
    let scheduler = BacktestScheduler::new(fast_config(2), executor.clone());

    let mut ids = Vec::new();
    for symbol in ["BTC", "ETH"] {
        for strategy in ["momentum", "mean_reversion"] {
            ids.push(scheduler.schedule_job(request(symbol, strategy)).await.unwrap());
        }
    }

    let started = Instant::now();
    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    let elapsed = started.elapsed();
    scheduler.stop().await;

    for id in &ids {
        assert_eq!(scheduler.get_job_status(id), Some(JobStatus::Completed));
    }
    assert_eq!(executor.max_running(), 2);
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);

    let status = scheduler.get_queue_status();
    assert_eq!(status.statistics.jobs_completed, 4);
    assert_eq!(status.completed_jobs, 4);
    assert_eq!(status.queue_size, 0);
    assert!(status.average_execution_time >= 0.2);
}

#[tokio::test]
async fn scenario_b_always_failing_job_ends_failed_after_all_attempts() {
    let executor = Arc::new(RecordingExecutor::new(Behavior::Fail, Duration::from_millis(5)));
    let scheduler = BacktestScheduler::new(fast_config(2), executor.clone());

    let id = scheduler
        .schedule_job(request("BTC", "momentum").with_max_retries(3))
        .await
        .unwrap();
    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    let job = scheduler.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert_eq!(executor.attempts(&id), 4);
    assert_eq!(job.error_message.as_deref(), Some("attempt 4 failed"));

    let stats = scheduler.get_statistics();
    assert_eq!(stats.jobs_completed, 0);
    assert_eq!(stats.jobs_failed, 1);
}

#[tokio::test]
async fn scenario_d_cancel_queued_but_not_running() {
    let executor = Arc::new(RecordingExecutor::new(
        Behavior::Succeed,
        Duration::from_millis(300),
    ));
    let scheduler = BacktestScheduler::new(fast_config(1), executor.clone());

    let running = scheduler.schedule_job(request("BTC", "first")).await.unwrap();
    scheduler.start().await.unwrap();
    assert!(
        wait_for_status(&scheduler, &running, JobStatus::Running, Duration::from_secs(2)).await
    );

    let queued = scheduler.schedule_job(request("ETH", "second")).await.unwrap();
    assert_eq!(scheduler.get_job_status(&queued), Some(JobStatus::Queued));
    assert!(scheduler.cancel_job(&queued).await);
    assert!(!scheduler.cancel_job(&running).await);
    assert!(!scheduler.cancel_job("no-such-job").await);

    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    assert_eq!(scheduler.get_job_status(&running), Some(JobStatus::Completed));
    assert_eq!(scheduler.get_job_status(&queued), Some(JobStatus::Cancelled));
    assert_eq!(executor.attempts(&queued), 0);
    assert_eq!(scheduler.get_statistics().jobs_cancelled, 1);
    assert!(!scheduler.cancel_job(&queued).await);
}

#[tokio::test]
async fn running_jobs_never_exceed_slot_count() {
    let executor = Arc::new(RecordingExecutor::new(
        Behavior::Succeed,
        Duration::from_millis(40),
    ));
    let scheduler = BacktestScheduler::new(fast_config(3), executor.clone());
    for i in 0..12 {
        scheduler
            .schedule_job(request("BTC", &format!("s{}", i)))
            .await
            .unwrap();
    }

    scheduler.start().await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let status = scheduler.get_queue_status();
        assert!(status.running_jobs <= 3, "running {}", status.running_jobs);
        assert!(status.resources.active <= 3);
        if status.statistics.jobs_completed == 12 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    scheduler.stop().await;

    assert_eq!(scheduler.get_statistics().jobs_completed, 12);
    assert!(executor.max_running() <= 3);
}

#[tokio::test]
async fn urgent_job_starts_before_batch_job() {
    let executor = Arc::new(RecordingExecutor::new(
        Behavior::Succeed,
        Duration::from_millis(10),
    ));
    let scheduler = BacktestScheduler::new(fast_config(1), executor.clone());

    scheduler
        .schedule_job(request("BTC", "batch").with_priority(JobPriority::Batch))
        .await
        .unwrap();
    scheduler
        .schedule_job(request("BTC", "normal").with_priority(JobPriority::Normal))
        .await
        .unwrap();
    scheduler
        .schedule_job(request("BTC", "urgent").with_priority(JobPriority::Urgent))
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    assert_eq!(executor.start_order(), vec!["urgent", "normal", "batch"]);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let executor = Arc::new(RecordingExecutor::new(
        Behavior::FailTimes(2),
        Duration::from_millis(5),
    ));
    let scheduler = BacktestScheduler::new(fast_config(1), executor.clone());
    let id = scheduler.schedule_job(request("BTC", "flaky")).await.unwrap();

    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    let job = scheduler.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert!(job.error_message.is_none());
    assert_eq!(executor.attempts(&id), 3);
}

#[tokio::test]
async fn panics_and_errors_count_as_failures() {
    let panicking = Arc::new(RecordingExecutor::new(Behavior::Panic, Duration::ZERO));
    let scheduler = BacktestScheduler::new(fast_config(1), panicking.clone());
    let id = scheduler
        .schedule_job(request("BTC", "crash").with_max_retries(1))
        .await
        .unwrap();
    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    let job = scheduler.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(panicking.attempts(&id), 2);
    assert!(job.error_message.unwrap().contains("strategy crashed"));

    let erroring = Arc::new(RecordingExecutor::new(Behavior::Error, Duration::ZERO));
    let scheduler = BacktestScheduler::new(fast_config(1), erroring.clone());
    let id = scheduler
        .schedule_job(request("BTC", "error").with_max_retries(0))
        .await
        .unwrap();
    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    let job = scheduler.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("executor could not load data"));
}

#[tokio::test]
async fn timed_out_final_attempt_ends_in_timeout() {
    let executor = Arc::new(RecordingExecutor::new(Behavior::TimeOut, Duration::ZERO));
    let scheduler = BacktestScheduler::new(fast_config(1), executor.clone());
    let id = scheduler
        .schedule_job(request("BTC", "slow").with_max_retries(1))
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    assert_eq!(scheduler.get_job_status(&id), Some(JobStatus::Timeout));
    assert_eq!(executor.attempts(&id), 2);
    assert_eq!(scheduler.get_statistics().jobs_failed, 1);
}

#[tokio::test]
async fn deferred_job_waits_for_its_start_time() {
    let executor = Arc::new(RecordingExecutor::new(Behavior::Succeed, Duration::ZERO));
    let scheduler = BacktestScheduler::new(fast_config(2), executor.clone());

    let not_before = Utc::now() + ChronoDuration::milliseconds(300);
    let id = scheduler
        .schedule_job(request("BTC", "later").scheduled_for(not_before))
        .await
        .unwrap();
    let now_id = scheduler.schedule_job(request("ETH", "now")).await.unwrap();

    scheduler.start().await.unwrap();
    assert!(wait_for_status(&scheduler, &now_id, JobStatus::Completed, Duration::from_secs(2)).await);
    assert_eq!(scheduler.get_job_status(&id), Some(JobStatus::Queued));

    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    let job = scheduler.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.execution_start.unwrap() >= not_before);
}

#[tokio::test]
async fn persisted_state_has_one_record_per_job_and_reloads_completed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let config = fast_config(2).with_persistence_path(&path);

    let executor = Arc::new(RecordingExecutor::new(
        Behavior::FailTimes(1),
        Duration::from_millis(5),
    ));
    let scheduler = BacktestScheduler::open(config.clone(), executor, None)
        .await
        .unwrap();
    let ids = scheduler
        .schedule_jobs(vec![request("BTC", "a"), request("ETH", "b")])
        .await
        .unwrap();
    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    let store = JobStore::open(&path).await.unwrap();
    let records = store.all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|j| j.status == JobStatus::Completed));

    // Replaying a completion must update, not duplicate
    let replay = records[0].clone();
    store.save(&replay).await.unwrap();
    store.save(&replay).await.unwrap();
    assert_eq!(store.all().await.unwrap().len(), 2);

    let fresh = Arc::new(RecordingExecutor::new(Behavior::Succeed, Duration::ZERO));
    let restarted = BacktestScheduler::open(config, fresh, None).await.unwrap();
    for id in &ids {
        assert_eq!(restarted.get_job_status(id), Some(JobStatus::Completed));
    }
    assert_eq!(restarted.list_jobs(Some(JobStatus::Completed)).len(), 2);
    assert_eq!(restarted.get_queue_status().completed_jobs, 2);
}

#[tokio::test]
async fn cancel_during_retry_backoff_is_what_gets_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let config = fast_config(1)
        .with_retry_backoff(Duration::from_millis(300))
        .with_persistence_path(&path);

    let executor = Arc::new(RecordingExecutor::new(Behavior::Fail, Duration::from_millis(5)));
    let scheduler = BacktestScheduler::open(config, executor.clone(), None)
        .await
        .unwrap();
    let id = scheduler
        .schedule_job(request("BTC", "flaky").with_max_retries(3))
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    // First attempt failed and the job is back in QUEUED waiting out the backoff
    let deadline = Instant::now() + Duration::from_secs(2);
    while !(executor.attempts(&id) == 1
        && scheduler.get_job(&id).map(|j| j.retry_count) == Some(1))
    {
        assert!(Instant::now() < deadline, "first attempt never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(scheduler.get_job_status(&id), Some(JobStatus::Queued));
    assert!(scheduler.cancel_job(&id).await);

    tokio::time::sleep(Duration::from_millis(400)).await;
    scheduler.stop().await;

    assert_eq!(executor.attempts(&id), 1);
    let store = JobStore::open(&path).await.unwrap();
    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert_eq!(stored.retry_count, 1);
}

#[tokio::test]
async fn start_validates_config_and_rejects_second_start() {
    let executor = Arc::new(RecordingExecutor::new(Behavior::Succeed, Duration::ZERO));

    let broken = BacktestScheduler::new(fast_config(0), executor.clone());
    assert!(matches!(broken.start().await, Err(SchedulerError::Setup(_))));
    assert!(!broken.is_running().await);

    let scheduler = BacktestScheduler::new(fast_config(1), executor);
    scheduler.start().await.unwrap();
    assert!(scheduler.is_running().await);
    assert!(matches!(
        scheduler.start().await,
        Err(SchedulerError::AlreadyRunning)
    ));
    scheduler.stop().await;
    assert!(!scheduler.is_running().await);
    // Stopping twice is harmless
    scheduler.stop().await;
}

#[tokio::test]
async fn stop_drains_in_flight_jobs() {
    let executor = Arc::new(RecordingExecutor::new(
        Behavior::Succeed,
        Duration::from_millis(300),
    ));
    let scheduler = BacktestScheduler::new(fast_config(4), executor);
    let ids = scheduler
        .schedule_jobs((0..4).map(|i| request("BTC", &format!("s{}", i))).collect())
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    for id in &ids {
        assert!(wait_for_status(&scheduler, id, JobStatus::Running, Duration::from_secs(2)).await);
    }
    scheduler.stop().await;

    for id in &ids {
        let status = scheduler.get_job_status(id).unwrap();
        assert!(status.is_terminal(), "job left in {}", status);
    }
    assert_eq!(scheduler.get_queue_status().running_jobs, 0);
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    let executor = Arc::new(RecordingExecutor::new(Behavior::Succeed, Duration::ZERO));
    let scheduler = BacktestScheduler::new(fast_config(1), executor);
    let a = scheduler.schedule_job(request("BTC", "a")).await.unwrap();
    let b = scheduler.schedule_job(request("ETH", "b")).await.unwrap();
    assert!(scheduler.cancel_job(&b).await);

    let queued = scheduler.list_jobs(Some(JobStatus::Queued));
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, a);
    assert_eq!(scheduler.list_jobs(Some(JobStatus::Cancelled))[0].id, b);
    assert_eq!(scheduler.list_jobs(None).len(), 2);
}

#[tokio::test]
async fn metrics_track_scheduler_activity() {
    let metrics = Arc::new(Metrics::new().unwrap());
    let executor = Arc::new(RecordingExecutor::new(
        Behavior::FailTimes(1),
        Duration::from_millis(5),
    ));
    let scheduler =
        BacktestScheduler::with_components(fast_config(2), executor, None, Some(metrics.clone()));
    scheduler.schedule_job(request("BTC", "a")).await.unwrap();
    scheduler.start().await.unwrap();
    assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
    scheduler.stop().await;

    assert_eq!(metrics.jobs_scheduled_total.get(), 1);
    assert_eq!(metrics.jobs_completed_total.get(), 1);
    assert_eq!(metrics.jobs_retried_total.get(), 1);
    assert_eq!(metrics.jobs_running.get(), 0);
}
