//! Priority queue for pending jobs
//!
//! Ordering is by [`JobPriority`] first (URGENT before BATCH), then by a
//! monotonic sequence number assigned at enqueue time so that jobs of the
//! same priority come out in insertion order.

use crate::models::job::{Job, JobPriority};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct QueuedJob {
    priority: JobPriority,
    sequence: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the "greatest" entry is the lowest
        // priority value, then the lowest sequence
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    next_sequence: u64,
}

/// Thread-safe priority queue with a bounded blocking dequeue
#[derive(Default)]
pub struct PriorityJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PriorityJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a job behind every queued job of the same priority
    pub fn enqueue(&self, job: Job) {
        {
            let mut state = self.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(QueuedJob {
                priority: job.priority,
                sequence,
                job,
            });
        }
        self.notify.notify_one();
    }

    /// Pop the highest-priority job without waiting
    pub fn try_dequeue(&self) -> Option<Job> {
        self.lock().heap.pop().map(|entry| entry.job)
    }

    /// Pop the next job.
    ///
    /// With `blocking` set, waits up to `timeout` for a job to arrive and
    /// returns `None` if none did; otherwise behaves like [`try_dequeue`].
    ///
    /// [`try_dequeue`]: Self::try_dequeue
    pub async fn dequeue(&self, blocking: bool, timeout: Duration) -> Option<Job> {
        if !blocking {
            return self.try_dequeue();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_dequeue() {
                return Some(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_dequeue();
            }
        }
    }

    pub fn peek_size(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peek_size() == 0
    }
}
