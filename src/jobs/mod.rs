//! Job queueing primitives: priority queue, resource gate, persistence,
//! and the executor contract

pub mod executor;
pub mod queue;
pub mod resources;
pub mod store;

pub use executor::{ExecutorError, FnExecutor, JobExecutor};
pub use queue::PriorityJobQueue;
pub use resources::{ResourceManager, ResourceStatus};
pub use store::{JobStore, StoreError};
