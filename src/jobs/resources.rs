//! Concurrency gate for running jobs

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Point-in-time view of slot usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub active: usize,
    pub max: usize,
    pub available: usize,
}

/// Tracks which jobs hold one of `max_concurrent` execution slots.
///
/// Every read and mutation goes through the same lock. `can_start` is only
/// a hint; `register` is the authoritative check and may still refuse.
pub struct ResourceManager {
    max_concurrent: usize,
    active: Mutex<HashSet<String>>,
}

impl ResourceManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            active: Mutex::new(HashSet::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn can_start(&self) -> bool {
        self.lock().len() < self.max_concurrent
    }

    /// Claim a slot for `job_id`.
    ///
    /// Returns false when no slot is free or the job already holds one;
    /// callers treat that as "try again later".
    pub fn register(&self, job_id: &str) -> bool {
        let mut active = self.lock();
        if active.len() >= self.max_concurrent {
            debug!(job_id = %job_id, active = active.len(), "ResourceManager: no free slot");
            return false;
        }
        if !active.insert(job_id.to_string()) {
            warn!(job_id = %job_id, "ResourceManager: job already holds a slot");
            return false;
        }
        true
    }

    /// Release the slot held by `job_id`; false if it held none
    pub fn unregister(&self, job_id: &str) -> bool {
        self.lock().remove(job_id)
    }

    pub fn is_registered(&self, job_id: &str) -> bool {
        self.lock().contains(job_id)
    }

    pub fn status(&self) -> ResourceStatus {
        let active = self.lock().len();
        ResourceStatus {
            active,
            max: self.max_concurrent,
            available: self.max_concurrent.saturating_sub(active),
        }
    }
}
