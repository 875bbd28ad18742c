//! `JobQueue`: the surface the CLI talks to.
//!
//! Wraps a store, the engine settings, and at most one local worker pool.
//! Callers never touch job state except through these operations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use queuectl_core::{Job, JobId, JobSpec, JobState, WorkerId};

use crate::config::{ConfigError, EngineConfig, SqliteConfigStore};
use crate::db;
use crate::jobs::{
    CommandRunner, DeadLetterQueue, JobStore, JobStoreError, Page, QueueStatus, SqliteJobStore,
    WorkerPool,
};

pub struct JobQueue<S: JobStore + Clone + 'static> {
    store: S,
    config: EngineConfig,
    runner: Arc<dyn CommandRunner>,
    workers: Mutex<Option<WorkerPool>>,
}

impl<S: JobStore + Clone + 'static> JobQueue<S> {
    pub fn new(store: S, config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            store,
            config,
            runner,
            workers: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn enqueue(&self, spec: JobSpec) -> Result<JobId, JobStoreError> {
        let id = self.store.enqueue(spec).await?;
        info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    pub async fn get(&self, id: &JobId) -> Result<Job, JobStoreError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))
    }

    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.store.list(state, page).await
    }

    pub async fn get_status(&self) -> Result<QueueStatus, JobStoreError> {
        self.store.status().await
    }

    /// Start `count` local workers. Fails if this queue already runs a pool.
    pub async fn start_workers(
        &self,
        count: usize,
        poll_interval: Option<Duration>,
    ) -> Result<Vec<WorkerId>, JobStoreError> {
        let mut slot = self.workers.lock().await;
        if slot.is_some() {
            return Err(JobStoreError::Validation(
                "workers are already running".into(),
            ));
        }

        let pool = WorkerPool::start(
            self.store.clone(),
            self.runner.clone(),
            count,
            self.config.worker_config(poll_interval),
        )?;
        let ids = pool.worker_ids().cloned().collect();
        *slot = Some(pool);
        Ok(ids)
    }

    /// Stop local workers after their in-flight jobs. `false` if none were running.
    pub async fn stop_workers(&self) -> bool {
        let pool = self.workers.lock().await.take();
        match pool {
            Some(pool) => {
                pool.stop().await;
                true
            }
            None => false,
        }
    }

    /// Resolve when the local pool has been asked to stop (including through
    /// [`JobQueue::request_stop`] from another process). Immediate if no pool runs.
    pub async fn workers_stopping(&self) {
        let signal = self
            .workers
            .lock()
            .await
            .as_ref()
            .map(|pool| pool.shutdown_signal());
        if let Some(mut rx) = signal {
            let _ = rx.wait_for(|stop| *stop).await;
        }
    }

    pub async fn live_workers(&self) -> usize {
        self.workers
            .lock()
            .await
            .as_ref()
            .map_or(0, |pool| pool.live_count())
    }

    /// Ask every pool sharing this store, in any process, to stop.
    pub async fn request_stop(&self) -> Result<(), JobStoreError> {
        self.store.request_stop(Utc::now()).await
    }

    pub fn dlq(&self) -> DeadLetterQueue<S> {
        DeadLetterQueue::new(self.store.clone())
    }

    pub async fn dlq_list(&self) -> Result<Vec<Job>, JobStoreError> {
        self.dlq().list().await
    }

    pub async fn dlq_retry(&self, id: &JobId) -> Result<bool, JobStoreError> {
        self.dlq().retry(id).await
    }
}

impl JobQueue<SqliteJobStore> {
    /// Open the database at `path` and load engine settings from its config table.
    pub async fn open(path: &Path) -> Result<Self, ConfigError> {
        let pool = db::open(path).await?;
        let config = EngineConfig::load(&SqliteConfigStore::new(pool.clone())).await?;
        let store = SqliteJobStore::new(pool, config.store_settings());
        let runner = Arc::new(config.command_runner());
        Ok(Self::new(store, config, runner))
    }

    pub fn config_store(&self) -> SqliteConfigStore {
        SqliteConfigStore::new(self.store.pool().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, ShellCommandRunner};

    fn queue() -> JobQueue<Arc<InMemoryJobStore>> {
        let config = EngineConfig::default();
        JobQueue::new(
            InMemoryJobStore::arc(config.store_settings()),
            config,
            Arc::new(ShellCommandRunner::new()),
        )
    }

    #[tokio::test]
    async fn get_unknown_job_is_not_found() {
        let q = queue();
        assert!(matches!(
            q.get(&JobId::from_raw("ghost")).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn workers_start_once_and_stop() {
        let q = queue();
        let ids = q.start_workers(2, Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(q.live_workers().await, 2);

        assert!(matches!(
            q.start_workers(1, None).await,
            Err(JobStoreError::Validation(_))
        ));

        assert!(q.stop_workers().await);
        assert!(!q.stop_workers().await);
        assert_eq!(q.live_workers().await, 0);
    }

    #[tokio::test]
    async fn request_stop_reaches_local_pool() {
        let q = queue();
        q.start_workers(1, Some(Duration::from_millis(10))).await.unwrap();
        q.request_stop().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), q.workers_stopping())
            .await
            .unwrap();
        assert!(q.stop_workers().await);
    }
}
