//! Dead letter queue view.
//!
//! The DLQ is not a separate table: it is the set of jobs in state `dead`.
//! Jobs land there only through an exhausted `fail`; they leave only through
//! an explicit [`DeadLetterQueue::retry`].

use chrono::{DateTime, Utc};
use tracing::info;

use queuectl_core::{Job, JobId};

use super::store::{JobStore, JobStoreError};

/// Read/replay access to dead jobs.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue<S: JobStore> {
    store: S,
}

impl<S: JobStore> DeadLetterQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Most recently dead-lettered first.
    pub async fn list(&self) -> Result<Vec<Job>, JobStoreError> {
        self.store.dlq_list().await
    }

    pub async fn len(&self) -> Result<usize, JobStoreError> {
        Ok(self.store.status().await?.jobs.dead)
    }

    /// Move a dead job back to `pending`, due immediately, with `attempts`
    /// reset to 0. `last_error` is kept for reference.
    ///
    /// Returns `false` if the id is unknown or the job is not dead.
    pub async fn retry(&self, id: &JobId) -> Result<bool, JobStoreError> {
        self.retry_at(id, Utc::now()).await
    }

    pub async fn retry_at(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let retried = self.store.dlq_retry_at(id, now).await?;
        if retried {
            info!(job_id = %id, "dead job re-enqueued");
        }
        Ok(retried)
    }
}
