//! Priority scheduler coordinating backtest job execution
//!
//! One coordinator task pulls jobs from the [`PriorityJobQueue`], gates them
//! on the [`ResourceManager`], and spawns each execution as its own task.
//! Finished attempts are either completed, re-enqueued after a fixed
//! backoff, or failed permanently once `max_retries` is used up.

use crate::config::SchedulerConfig;
use crate::jobs::executor::JobExecutor;
use crate::jobs::queue::PriorityJobQueue;
use crate::jobs::resources::{ResourceManager, ResourceStatus};
use crate::jobs::store::{JobStore, StoreError};
use crate::metrics::Metrics;
use crate::models::job::{Job, JobError, JobRequest, JobResult, JobStatus};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler setup error: {0}")]
    Setup(String),
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Cumulative counters since the scheduler was created
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub jobs_scheduled: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// Seconds spent executing jobs that completed
    pub total_execution_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub completed_jobs: usize,
    pub running_jobs: usize,
    pub resources: ResourceStatus,
    pub statistics: SchedulerStats,
    pub average_execution_time: f64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    executor: Arc<dyn JobExecutor>,
    queue: PriorityJobQueue,
    resources: ResourceManager,
    store: Option<Arc<JobStore>>,
    /// Held from reading a job's latest state until its save completes
    persist_lock: tokio::sync::Mutex<()>,
    metrics: Option<Arc<Metrics>>,
    jobs: RwLock<HashMap<String, Job>>,
    completed: RwLock<HashMap<String, Job>>,
    stats: Mutex<SchedulerStats>,
    tracker: TaskTracker,
    shutdown: Mutex<CancellationToken>,
}

/// Scheduler for long-running backtest jobs
pub struct BacktestScheduler {
    inner: Arc<SchedulerInner>,
    handle: Arc<tokio::sync::RwLock<Option<JoinHandle<()>>>>,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BacktestScheduler {
    /// Create an in-memory scheduler without persistence or metrics
    pub fn new(config: SchedulerConfig, executor: Arc<dyn JobExecutor>) -> Self {
        Self::with_components(config, executor, None, None)
    }

    pub fn with_components(
        config: SchedulerConfig,
        executor: Arc<dyn JobExecutor>,
        store: Option<Arc<JobStore>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let resources = ResourceManager::new(config.max_concurrent_jobs);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                executor,
                queue: PriorityJobQueue::new(),
                resources,
                store,
                persist_lock: tokio::sync::Mutex::new(()),
                metrics,
                jobs: RwLock::new(HashMap::new()),
                completed: RwLock::new(HashMap::new()),
                stats: Mutex::new(SchedulerStats::default()),
                tracker: TaskTracker::new(),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
            handle: Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    /// Create a scheduler, opening the job store named by
    /// `config.persistence_path` and reloading its completed jobs
    pub async fn open(
        config: SchedulerConfig,
        executor: Arc<dyn JobExecutor>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, SchedulerError> {
        let store = match &config.persistence_path {
            Some(path) => Some(Arc::new(JobStore::open(path.clone()).await?)),
            None => None,
        };
        let scheduler = Self::with_components(config, executor, store, metrics);
        scheduler.restore_completed().await?;
        Ok(scheduler)
    }

    /// Load COMPLETED records from the store into the completed-job index.
    ///
    /// Returns the number of jobs restored; jobs that were still pending,
    /// queued or running in a previous run are not resumed.
    pub async fn restore_completed(&self) -> Result<usize, SchedulerError> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let restored = store.load_completed().await?;
        let count = restored.len();
        let mut completed = write(&self.inner.completed);
        for job in restored {
            completed.insert(job.id.clone(), job);
        }
        info!(count = count, "BacktestScheduler: restored {} completed jobs", count);
        Ok(count)
    }

    /// Accept a job and place it on the queue; returns its id
    pub async fn schedule_job(&self, request: JobRequest) -> Result<String, SchedulerError> {
        let mut job = Job::from_request(request);
        let job_id = job.id.clone();
        self.inner.persist(&job).await;

        job.transition(JobStatus::Queued)?;
        write(&self.inner.jobs).insert(job_id.clone(), job.clone());
        self.inner.persist(&job).await;

        info!(
            job_id = %job_id,
            symbol = %job.symbol,
            strategy = %job.strategy,
            priority = ?job.priority,
            "BacktestScheduler: scheduled job {} ({} / {})",
            job_id,
            job.symbol,
            job.strategy
        );

        self.inner.queue.enqueue(job);
        lock(&self.inner.stats).jobs_scheduled += 1;
        if let Some(metrics) = &self.inner.metrics {
            metrics.jobs_scheduled_total.inc();
            metrics.jobs_queued.set(self.inner.queue.peek_size() as i64);
        }
        Ok(job_id)
    }

    pub async fn schedule_jobs(
        &self,
        requests: Vec<JobRequest>,
    ) -> Result<Vec<String>, SchedulerError> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.schedule_job(request).await?);
        }
        Ok(ids)
    }

    /// Cancel a PENDING or QUEUED job.
    ///
    /// Running jobs cannot be cancelled; this returns false for them and for
    /// unknown or already finished jobs.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let snapshot = {
            let mut jobs = write(&self.inner.jobs);
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            if !matches!(job.status, JobStatus::Pending | JobStatus::Queued) {
                debug!(
                    job_id = %job_id,
                    status = %job.status,
                    "BacktestScheduler: job {} cannot be cancelled in state {}",
                    job_id,
                    job.status
                );
                return false;
            }
            if job.transition(JobStatus::Cancelled).is_err() {
                return false;
            }
            job.clone()
        };

        lock(&self.inner.stats).jobs_cancelled += 1;
        if let Some(metrics) = &self.inner.metrics {
            metrics.jobs_cancelled_total.inc();
        }
        self.inner.persist(&snapshot).await;
        info!(job_id = %job_id, "BacktestScheduler: cancelled job {}", job_id);
        true
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        if let Some(job) = read(&self.inner.jobs).get(job_id) {
            return Some(job.clone());
        }
        read(&self.inner.completed).get(job_id).cloned()
    }

    pub fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.get_job(job_id).map(|job| job.status)
    }

    /// All known jobs, optionally filtered by status, oldest first
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut merged: HashMap<String, Job> = read(&self.inner.completed).clone();
        for (id, job) in read(&self.inner.jobs).iter() {
            merged.insert(id.clone(), job.clone());
        }
        let mut jobs: Vec<Job> = merged
            .into_values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn get_statistics(&self) -> SchedulerStats {
        lock(&self.inner.stats).clone()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let statistics = self.get_statistics();
        let running_jobs = read(&self.inner.jobs)
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .count();
        let average_execution_time = if statistics.jobs_completed > 0 {
            statistics.total_execution_time / statistics.jobs_completed as f64
        } else {
            0.0
        };
        QueueStatus {
            queue_size: self.inner.queue.peek_size(),
            completed_jobs: read(&self.inner.completed).len(),
            running_jobs,
            resources: self.inner.resources.status(),
            statistics,
            average_execution_time,
        }
    }

    /// Start the coordinator loop
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.inner
            .config
            .validate()
            .map_err(SchedulerError::Setup)?;

        let mut handle = self.handle.write().await;
        if handle.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *lock(&self.inner.shutdown) = token.clone();
        self.inner.tracker.reopen();

        let inner = self.inner.clone();
        *handle = Some(tokio::spawn(async move {
            inner.run(token).await;
        }));

        info!(
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            "BacktestScheduler: started with {} execution slots",
            self.inner.config.max_concurrent_jobs
        );
        Ok(())
    }

    /// Stop the coordinator loop and wait for in-flight executions.
    ///
    /// Running jobs are not preempted; the wait is bounded by
    /// `shutdown_timeout`.
    pub async fn stop(&self) {
        let Some(handle) = self.handle.write().await.take() else {
            return;
        };

        lock(&self.inner.shutdown).cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "BacktestScheduler: coordinator task failed");
        }

        self.inner.tracker.close();
        let in_flight = self.inner.tracker.len();
        if tokio::time::timeout(self.inner.config.shutdown_timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.inner.tracker.len(),
                "BacktestScheduler: shutdown timeout elapsed with executions still running"
            );
        } else if in_flight > 0 {
            info!(in_flight = in_flight, "BacktestScheduler: in-flight executions drained");
        }
        info!("BacktestScheduler: stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.handle.read().await.is_some()
    }

    /// Wait until every known job is terminal and no execution task is alive
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = read(&self.inner.jobs)
                .values()
                .any(|job| !job.status.is_terminal());
            if !pending && self.inner.tracker.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.inner.config.idle_poll_interval).await;
        }
    }
}

impl SchedulerInner {
    /// Save the registry's current version of `job`, or `job` itself when
    /// the registry does not hold it yet.
    ///
    /// Writes are serialized and always read the latest state, so a stale
    /// snapshot can never overwrite a newer status.
    async fn persist(&self, job: &Job) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let job = self.latest(job);
        if let Err(e) = store.save(&job).await {
            error!(
                job_id = %job.id,
                status = %job.status,
                error = %e,
                "BacktestScheduler: failed to persist job {}",
                job.id
            );
        }
    }

    fn latest(&self, job: &Job) -> Job {
        if let Some(current) = read(&self.jobs).get(&job.id) {
            return current.clone();
        }
        read(&self.completed)
            .get(&job.id)
            .cloned()
            .unwrap_or_else(|| job.clone())
    }

    async fn pause(&self, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("BacktestScheduler: coordinator loop running");

        while !token.is_cancelled() {
            if !self.resources.can_start() {
                self.pause(&token).await;
                continue;
            }

            let dequeued = tokio::select! {
                _ = token.cancelled() => break,
                job = self.queue.dequeue(true, self.config.dequeue_timeout) => job,
            };
            let Some(dequeued) = dequeued else {
                continue;
            };
            if let Some(metrics) = &self.metrics {
                metrics.jobs_queued.set(self.queue.peek_size() as i64);
            }

            let current = read(&self.jobs).get(&dequeued.id).cloned();
            let Some(current) = current else {
                warn!(job_id = %dequeued.id, "BacktestScheduler: dequeued unknown job, dropping");
                continue;
            };
            if current.status != JobStatus::Queued {
                debug!(
                    job_id = %current.id,
                    status = %current.status,
                    "BacktestScheduler: skipping job {} in state {}",
                    current.id,
                    current.status
                );
                continue;
            }

            if current.is_deferred(Utc::now()) {
                self.queue.enqueue(current);
                self.pause(&token).await;
                continue;
            }

            if !self.resources.register(&current.id) {
                self.queue.enqueue(current);
                self.pause(&token).await;
                continue;
            }

            let running = {
                let mut jobs = write(&self.jobs);
                match jobs.get_mut(&current.id) {
                    Some(job) if job.status == JobStatus::Queued => match job.mark_running() {
                        Ok(()) => Some(job.clone()),
                        Err(e) => {
                            error!(error = %e, "BacktestScheduler: cannot start job");
                            None
                        }
                    },
                    _ => None,
                }
            };
            let Some(running) = running else {
                self.resources.unregister(&current.id);
                continue;
            };

            if let Some(metrics) = &self.metrics {
                metrics.jobs_running.inc();
            }
            info!(
                job_id = %running.id,
                attempt = running.retry_count + 1,
                priority = ?running.priority,
                "BacktestScheduler: dispatching job {} (attempt {})",
                running.id,
                running.retry_count + 1
            );

            let inner = self.clone();
            let job_token = token.child_token();
            self.tracker.spawn(async move {
                inner.execute(running, job_token).await;
            });
        }

        info!("BacktestScheduler: coordinator loop exited");
    }

    async fn execute(self: Arc<Self>, job: Job, token: CancellationToken) {
        self.persist(&job).await;
        let started = Instant::now();

        let executor = self.executor.clone();
        let attempt = job.clone();
        let outcome = tokio::spawn(async move { executor.execute(&attempt).await }).await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => JobResult::failure(e.to_string()),
            Err(join_error) if join_error.is_panic() => {
                let payload = join_error.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                JobResult::failure(format!("executor panicked: {}", message))
            }
            Err(join_error) => JobResult::failure(format!("executor task aborted: {}", join_error)),
        };
        let elapsed = started.elapsed();

        let (snapshot, retry) = self.record_outcome(&job.id, result, elapsed);

        self.resources.unregister(&job.id);
        if let Some(metrics) = &self.metrics {
            metrics.jobs_running.dec();
        }

        let Some(snapshot) = snapshot else {
            return;
        };
        self.persist(&snapshot).await;

        if retry {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
            let requeue = read(&self.jobs)
                .get(&snapshot.id)
                .filter(|job| job.status == JobStatus::Queued)
                .cloned();
            if let Some(job) = requeue {
                self.queue.enqueue(job);
            }
        }
    }

    /// Apply an attempt's result to the registry; returns the updated job
    /// and whether it was put back for another attempt
    fn record_outcome(
        &self,
        job_id: &str,
        result: JobResult,
        elapsed: Duration,
    ) -> (Option<Job>, bool) {
        let mut jobs = write(&self.jobs);
        let Some(job) = jobs.get_mut(job_id) else {
            error!(job_id = %job_id, "BacktestScheduler: finished job vanished from registry");
            return (None, false);
        };

        if result.success {
            if let Err(e) = job.finish(JobStatus::Completed) {
                error!(error = %e, "BacktestScheduler: cannot complete job");
                return (Some(job.clone()), false);
            }
            job.error_message = None;
            job.result = Some(result);
            let duration = job.execution_duration().unwrap_or(elapsed);
            {
                let mut stats = lock(&self.stats);
                stats.jobs_completed += 1;
                stats.total_execution_time += duration.as_secs_f64();
            }
            if let Some(metrics) = &self.metrics {
                metrics.jobs_completed_total.inc();
                metrics
                    .job_execution_duration_seconds
                    .observe(duration.as_secs_f64());
            }
            write(&self.completed).insert(job.id.clone(), job.clone());
            info!(
                job_id = %job.id,
                duration_secs = duration.as_secs_f64(),
                "BacktestScheduler: job {} completed in {:.2}s",
                job.id,
                duration.as_secs_f64()
            );
            return (Some(job.clone()), false);
        }

        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "executor reported failure".to_string());
        let timed_out = result.timed_out;
        job.error_message = Some(message.clone());
        job.result = Some(result);

        if job.can_retry() {
            if let Err(e) = job.requeue_for_retry() {
                error!(error = %e, "BacktestScheduler: cannot requeue job");
                return (Some(job.clone()), false);
            }
            if let Some(metrics) = &self.metrics {
                metrics.jobs_retried_total.inc();
            }
            warn!(
                job_id = %job.id,
                retry = job.retry_count,
                max_retries = job.max_retries,
                error = %message,
                "BacktestScheduler: job {} failed, retry {}/{}",
                job.id,
                job.retry_count,
                job.max_retries
            );
            return (Some(job.clone()), true);
        }

        let terminal = if timed_out {
            JobStatus::Timeout
        } else {
            JobStatus::Failed
        };
        if let Err(e) = job.finish(terminal) {
            error!(error = %e, "BacktestScheduler: cannot fail job");
            return (Some(job.clone()), false);
        }
        lock(&self.stats).jobs_failed += 1;
        if let Some(metrics) = &self.metrics {
            metrics.jobs_failed_total.inc();
        }
        error!(
            job_id = %job.id,
            attempts = job.retry_count + 1,
            status = %job.status,
            error = %message,
            "BacktestScheduler: job {} ended {} after {} attempts",
            job.id,
            job.status,
            job.retry_count + 1
        );
        (Some(job.clone()), false)
    }
}
