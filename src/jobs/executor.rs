//! Job executor contract injected into the scheduler

use crate::models::job::{Job, JobResult};
use async_trait::async_trait;
use std::future::Future;

pub type ExecutorError = Box<dyn std::error::Error + Send + Sync>;

/// Performs the actual backtest for one job.
///
/// The scheduler treats `Err(_)` and panics exactly like a result with
/// `success == false`. `job.timeout_seconds` is not enforced by the
/// scheduler; executors that care about it must honor it themselves and
/// report [`JobResult::timed_out`].
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<JobResult, ExecutorError>;
}

/// Adapts an async closure into a [`JobExecutor`]
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobExecutor for FnExecutor<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JobResult, ExecutorError>> + Send,
{
    async fn execute(&self, job: &Job) -> Result<JobResult, ExecutorError> {
        (self.f)(job.clone()).await
    }
}
