//! Environment-driven configuration for the scheduler and bridge sessions

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Current deployment environment (`APP_ENV`, defaults to `sandbox`)
pub fn get_environment() -> String {
    env::var("APP_ENV").unwrap_or_else(|_| "sandbox".to_string())
}

/// Redis URL used by the message bus (`REDIS_URL`)
pub fn get_redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Configuration for the scheduler coordinator
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs allowed to be RUNNING at once
    pub max_concurrent_jobs: usize,
    /// Upper bound on a single blocking dequeue
    pub dequeue_timeout: Duration,
    /// Pause used when capacity is exhausted or a job is not yet due
    pub idle_poll_interval: Duration,
    /// Fixed delay before a failed job is re-enqueued
    pub retry_backoff: Duration,
    /// Location of the job store; `None` keeps state in memory only
    pub persistence_path: Option<PathBuf>,
    /// How long `stop()` waits for in-flight executions
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            dequeue_timeout: Duration::from_secs(1),
            idle_poll_interval: Duration::from_millis(100),
            retry_backoff: Duration::from_secs(5),
            persistence_path: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs),
            dequeue_timeout: env_millis("DEQUEUE_TIMEOUT_MS").unwrap_or(defaults.dequeue_timeout),
            idle_poll_interval: env_millis("IDLE_POLL_INTERVAL_MS")
                .unwrap_or(defaults.idle_poll_interval),
            retry_backoff: env_millis("RETRY_BACKOFF_MS").unwrap_or(defaults.retry_backoff),
            persistence_path: env::var("JOB_STORE_PATH").ok().map(PathBuf::from),
            shutdown_timeout: env_millis("SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.shutdown_timeout),
        }
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_persistence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = Some(path.into());
        self
    }

    /// Reject configurations the coordinator cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_jobs == 0 {
            return Err("max_concurrent_jobs must be greater than 0".to_string());
        }
        if self.dequeue_timeout.is_zero() {
            return Err("dequeue_timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Configuration shared by bridge sessions
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Namespace prepended to every session topic
    pub topic_prefix: String,
    pub readiness_timeout: Duration,
    /// Output substrings that count as a readiness signal
    pub readiness_markers: Vec<String>,
    pub bootstrap_interval: Duration,
    pub lookback_bars: usize,
    pub signal_poll_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub worker_join_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "bridge".to_string(),
            readiness_timeout: Duration::from_secs(30),
            readiness_markers: vec![
                "STRATEGY_READY".to_string(),
                "Strategy is ready".to_string(),
            ],
            bootstrap_interval: Duration::from_secs(1),
            lookback_bars: 500,
            signal_poll_timeout: Duration::from_millis(10),
            graceful_shutdown_timeout: Duration::from_secs(5),
            worker_join_timeout: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let readiness_markers = env::var("BRIDGE_READINESS_MARKERS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|markers| !markers.is_empty())
            .unwrap_or(defaults.readiness_markers);

        Self {
            topic_prefix: env::var("BRIDGE_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
            readiness_timeout: env_millis("BRIDGE_READINESS_TIMEOUT_MS")
                .unwrap_or(defaults.readiness_timeout),
            readiness_markers,
            bootstrap_interval: env_millis("BRIDGE_BOOTSTRAP_INTERVAL_MS")
                .unwrap_or(defaults.bootstrap_interval),
            lookback_bars: env_parse("BRIDGE_LOOKBACK_BARS").unwrap_or(defaults.lookback_bars),
            signal_poll_timeout: env_millis("BRIDGE_SIGNAL_POLL_MS")
                .unwrap_or(defaults.signal_poll_timeout),
            graceful_shutdown_timeout: env_millis("BRIDGE_SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.graceful_shutdown_timeout),
            worker_join_timeout: env_millis("BRIDGE_JOIN_TIMEOUT_MS")
                .unwrap_or(defaults.worker_join_timeout),
        }
    }

    /// Reject configurations a session cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.bootstrap_interval.is_zero() {
            return Err("bootstrap_interval must be non-zero".to_string());
        }
        if self.readiness_timeout.is_zero() {
            return Err("readiness_timeout must be non-zero".to_string());
        }
        if self.worker_join_timeout.is_zero() {
            return Err("worker_join_timeout must be non-zero".to_string());
        }
        Ok(())
    }
}
