//! Durable job store backed by a single JSON document
//!
//! Every save rewrites the whole collection (read, upsert, write). That is
//! fine for a few thousand jobs and becomes the bottleneck beyond that.

use crate::models::job::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobDocument {
    jobs: Vec<Job>,
}

pub struct JobStore {
    path: PathBuf,
    // Serializes read-modify-write cycles from concurrent completions
    write_lock: Mutex<()>,
}

impl JobStore {
    /// Open (or lazily create) the store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<JobDocument, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(JobDocument::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobDocument::default()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn write_document(&self, document: &JobDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Insert or replace the record for `job.id`
    pub async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        match document.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => document.jobs.push(job.clone()),
        }
        self.write_document(&document).await?;
        debug!(job_id = %job.id, status = %job.status, "JobStore: saved job");
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let document = self.read_document().await?;
        Ok(document.jobs.into_iter().find(|j| j.id == job_id))
    }

    pub async fn all(&self) -> Result<Vec<Job>, StoreError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.read_document().await?.jobs)
    }

    /// Records whose last known status is COMPLETED.
    ///
    /// Unfinished jobs from a previous run are reported but not returned;
    /// they are not resumed.
    pub async fn load_completed(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.all().await?;
        let unfinished = jobs.iter().filter(|j| !j.status.is_terminal()).count();
        if unfinished > 0 {
            warn!(
                count = unfinished,
                path = %self.path.display(),
                "JobStore: {} unfinished jobs from a previous run will not be resumed",
                unfinished
            );
        }
        Ok(jobs
            .into_iter()
            .filter(|j| j.status == JobStatus::Completed)
            .collect())
    }
}
