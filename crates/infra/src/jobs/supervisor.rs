//! Worker pool: owns worker lifetimes and tears them down as a unit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use queuectl_core::WorkerId;

use super::runner::CommandRunner;
use super::store::{JobStore, JobStoreError};
use super::worker::{Worker, WorkerConfig};

const MIN_STOP_POLL: Duration = Duration::from_millis(250);

/// Handle to a running set of workers.
///
/// Dropping the pool without calling [`WorkerPool::stop`] leaves the tasks
/// running until the runtime shuts down.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<(WorkerId, JoinHandle<()>)>,
    watcher: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing `store`, plus a watcher that turns a
    /// store-level stop request (from any process) into a local shutdown.
    pub fn start<S>(
        store: S,
        runner: Arc<dyn CommandRunner>,
        count: usize,
        config: WorkerConfig,
    ) -> Result<Self, JobStoreError>
    where
        S: JobStore + Clone + 'static,
    {
        if count == 0 {
            return Err(JobStoreError::Validation(
                "worker count must be at least 1".into(),
            ));
        }

        let started_at = Utc::now();
        let (shutdown, rx) = watch::channel(false);

        let workers = (0..count)
            .map(|index| {
                let id = WorkerId::generate(index);
                let worker = Worker::new(id.clone(), store.clone(), runner.clone(), config.clone());
                (id, tokio::spawn(worker.run(rx.clone())))
            })
            .collect();

        let watcher = tokio::spawn(watch_stop_requests(
            store,
            shutdown.clone(),
            rx,
            started_at,
            config.poll_interval.max(MIN_STOP_POLL),
        ));

        info!(count, "worker pool started");
        Ok(Self {
            shutdown,
            workers,
            watcher,
            started_at,
        })
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &WorkerId> {
        self.workers.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers whose loop has not exited yet.
    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Ask every worker to exit after its current iteration. Does not wait.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Receiver that flips to `true` once shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Resolve once shutdown has been requested locally or through the store.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_signal();
        // Err only if the sender is gone, which `self` prevents.
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Signal shutdown and wait for every worker to finish its in-flight job.
    pub async fn stop(self) {
        self.request_shutdown();
        self.join().await;
    }

    /// Wait for all workers to exit without signalling them.
    pub async fn join(self) {
        for (id, handle) in self.workers {
            if let Err(e) = handle.await {
                warn!(worker = %id, error = %e, "worker task ended abnormally");
            }
        }
        self.watcher.abort();
        info!("worker pool stopped");
    }
}

async fn watch_stop_requests<S: JobStore>(
    store: S,
    shutdown: watch::Sender<bool>,
    mut rx: watch::Receiver<bool>,
    since: DateTime<Utc>,
    every: Duration,
) {
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() || *rx.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(every) => {
                match store.stop_requested_since(since).await {
                    Ok(true) => {
                        info!("stop requested through the job store");
                        shutdown.send_replace(true);
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "failed to check for stop requests"),
                }
            }
        }
    }
}
