//! Shared data models spanning the scheduler and bridge layers.

pub mod bar;
pub mod job;
pub mod signal;

pub use bar::Bar;
pub use job::{
    Job, JobError, JobPriority, JobRequest, JobResult, JobStatus, DEFAULT_MAX_RETRIES,
    DEFAULT_TIMEOUT_SECONDS,
};
pub use signal::{SignalAction, StrategySignal};
