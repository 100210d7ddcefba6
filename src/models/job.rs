//! Backtest job model and its status state machine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

/// Queue priority. Lower numeric value is dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Urgent = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Batch = 5,
}

impl JobPriority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// `Running -> Queued` is the retry edge taken when a failed attempt
    /// still has retries left.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {job_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {job_id}: retry limit {max_retries} reached")]
    RetriesExhausted { job_id: String, max_retries: u32 },
}

/// Outcome reported by a job executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by executors that enforce the job's timeout themselves
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub metrics: HashMap<String, Value>,
}

impl JobResult {
    pub fn success(metrics: HashMap<String, Value>) -> Self {
        Self {
            success: true,
            error: None,
            timed_out: false,
            metrics,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            timed_out: false,
            metrics: HashMap::new(),
        }
    }

    pub fn timed_out(error: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::failure(error)
        }
    }
}

/// Caller-facing description of a job to schedule
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub symbol: String,
    pub strategy: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub parameters: HashMap<String, Value>,
    pub priority: JobPriority,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl JobRequest {
    pub fn new(
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            strategy: strategy.into(),
            start_date,
            end_date,
            parameters: HashMap::new(),
            priority: JobPriority::Normal,
            scheduled_for: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Delay eligibility until `at`
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

/// One unit of schedulable backtest work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub symbol: String,
    pub strategy: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub priority: JobPriority,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Recorded for the executor; the scheduler does not enforce it
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub execution_start: Option<DateTime<Utc>>,
    pub execution_end: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn from_request(request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: request.symbol,
            strategy: request.strategy,
            start_date: request.start_date,
            end_date: request.end_date,
            parameters: request.parameters,
            priority: request.priority,
            scheduled_for: request.scheduled_for,
            timeout_seconds: request.timeout_seconds,
            created_at: Utc::now(),
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: request.max_retries,
            execution_start: None,
            execution_end: None,
            result: None,
            error_message: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// True when `scheduled_for` lies in the future relative to `now`
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.is_some_and(|at| at > now)
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), JobError> {
        self.transition(JobStatus::Running)?;
        self.execution_start = Some(Utc::now());
        self.execution_end = None;
        Ok(())
    }

    /// Terminal transition for a finished attempt; stamps `execution_end`
    pub fn finish(&mut self, status: JobStatus) -> Result<(), JobError> {
        self.transition(status)?;
        let now = Utc::now();
        self.execution_end = Some(match self.execution_start {
            Some(start) if start > now => start,
            _ => now,
        });
        Ok(())
    }

    /// Put a failed attempt back in line, consuming one retry
    pub fn requeue_for_retry(&mut self) -> Result<(), JobError> {
        if self.retry_count >= self.max_retries {
            return Err(JobError::RetriesExhausted {
                job_id: self.id.clone(),
                max_retries: self.max_retries,
            });
        }
        self.transition(JobStatus::Queued)?;
        self.retry_count += 1;
        self.execution_start = None;
        self.execution_end = None;
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn execution_duration(&self) -> Option<Duration> {
        let (start, end) = (self.execution_start?, self.execution_end?);
        (end - start).to_std().ok()
    }
}
