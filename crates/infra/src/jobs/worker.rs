//! Worker loop: claim, execute, report.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use queuectl_core::{Job, JobId, WorkerId};

use super::runner::CommandRunner;
use super::store::{FailOutcome, JobStore, JobStoreError};

/// Ceiling for the pause after repeated store failures.
pub const MAX_STORE_BACKOFF: Duration = Duration::from_secs(30);

/// Shortest lease the engine accepts; shorter leases expire between heartbeats.
pub const MIN_LEASE_TIMEOUT: Duration = Duration::from_millis(100);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Lease refresh period while a command runs, and liveness refresh
    /// period while idle. Must stay below the lease timeout.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Heartbeat three times per lease so one missed beat does not forfeit it.
    pub fn for_lease(poll_interval: Duration, lease_timeout: Duration) -> Self {
        Self {
            poll_interval,
            heartbeat_interval: (lease_timeout / 3).max(Duration::from_millis(1)),
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing claimable.
    Idle,
    Completed(JobId),
    Failed { id: JobId, outcome: FailOutcome },
    /// The claim was taken over while the command ran; the result was dropped.
    Lost(JobId),
}

/// A single polling worker.
pub struct Worker<S: JobStore> {
    id: WorkerId,
    store: S,
    runner: Arc<dyn CommandRunner>,
    config: WorkerConfig,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(id: WorkerId, store: S, runner: Arc<dyn CommandRunner>, config: WorkerConfig) -> Self {
        Self {
            id,
            store,
            runner,
            config,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Run one iteration: claim a job, execute it, report the outcome.
    pub async fn tick(&self) -> Result<TickOutcome, JobStoreError> {
        let Some(job) = self.store.claim(&self.id).await? else {
            return Ok(TickOutcome::Idle);
        };

        debug!(worker = %self.id, job_id = %job.id, attempts = job.attempts, "claimed job");
        self.execute(job).await
    }

    async fn execute(&self, job: Job) -> Result<TickOutcome, JobStoreError> {
        let Some(token) = job.claim_token.clone() else {
            return Err(JobStoreError::Unavailable(format!(
                "claimed job {} has no claim token",
                job.id
            )));
        };

        let run = self.runner.run(&job.command);
        tokio::pin!(run);

        let mut beat = tokio::time::interval(self.config.heartbeat_interval);
        beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        beat.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = beat.tick() => {
                    match self.store.heartbeat(&job.id, &token).await {
                        Ok(true) => {}
                        Ok(false) => warn!(worker = %self.id, job_id = %job.id, "claim lost while running"),
                        Err(e) => warn!(worker = %self.id, job_id = %job.id, error = %e, "lease heartbeat failed"),
                    }
                    self.beat().await;
                }
            }
        };

        let error_text = match result {
            Ok(exec) if exec.success => {
                return if self.store.complete(&job.id, &token).await? {
                    debug!(
                        worker = %self.id,
                        job_id = %job.id,
                        elapsed_ms = exec.duration.as_millis() as u64,
                        "job completed"
                    );
                    Ok(TickOutcome::Completed(job.id))
                } else {
                    warn!(worker = %self.id, job_id = %job.id, "completion dropped: claim no longer held");
                    Ok(TickOutcome::Lost(job.id))
                };
            }
            Ok(exec) => exec.failure_text(),
            Err(e) => e.to_string(),
        };

        let outcome = self.store.fail(&job.id, &token, &error_text).await?;
        match &outcome {
            FailOutcome::Retrying { attempts, run_at } => {
                info!(worker = %self.id, job_id = %job.id, attempts, %run_at, error = %error_text, "job failed, retry scheduled");
            }
            FailOutcome::Dead { attempts } => {
                warn!(worker = %self.id, job_id = %job.id, attempts, error = %error_text, "job moved to dead letter queue");
            }
            FailOutcome::Ignored => {
                warn!(worker = %self.id, job_id = %job.id, "failure dropped: claim no longer held");
                return Ok(TickOutcome::Lost(job.id));
            }
        }
        Ok(TickOutcome::Failed { id: job.id, outcome })
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Shutdown is observed between iterations, so an in-flight command
    /// always runs to completion and its outcome is recorded.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "worker started");
        let mut store_backoff: Option<Duration> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.beat().await;

            let pause = match self.tick().await {
                Ok(TickOutcome::Idle) => {
                    store_backoff = None;
                    self.config.poll_interval
                }
                Ok(_) => {
                    store_backoff = None;
                    Duration::ZERO
                }
                Err(e) => {
                    let next = store_backoff
                        .map(|d| d.saturating_mul(2))
                        .unwrap_or(self.config.poll_interval)
                        .min(MAX_STORE_BACKOFF);
                    store_backoff = Some(next);
                    error!(worker = %self.id, error = %e, retry_in_ms = next.as_millis() as u64, "job store error");
                    next
                }
            };

            if pause.is_zero() {
                continue;
            }

            if !self.idle(pause, &mut shutdown).await {
                break;
            }
        }

        if let Err(e) = self.store.deregister_worker(&self.id).await {
            warn!(worker = %self.id, error = %e, "failed to deregister worker");
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// Sleep for `pause` or until `shutdown` changes, refreshing the liveness
    /// record every heartbeat interval. `false` once the sender is gone.
    async fn idle(&self, pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let wake = tokio::time::sleep(pause);
        tokio::pin!(wake);

        let mut beat = tokio::time::interval(self.config.heartbeat_interval);
        beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        beat.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => return changed.is_ok(),
                _ = &mut wake => return true,
                _ = beat.tick() => self.beat().await,
            }
        }
    }

    async fn beat(&self) {
        if let Err(e) = self.store.worker_heartbeat(&self.id, Utc::now()).await {
            debug!(worker = %self.id, error = %e, "worker heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use queuectl_core::{JobSpec, JobState, RetryPolicy};

    use super::*;
    use crate::jobs::runner::{ExecutionResult, RunnerError};
    use crate::jobs::store::{InMemoryJobStore, StoreSettings};

    /// Replays canned exit codes in order; `None` means spawn failure.
    struct ScriptedRunner {
        exits: Mutex<Vec<Option<i32>>>,
        delay: Duration,
    }

    impl ScriptedRunner {
        fn new(exits: Vec<Option<i32>>) -> Arc<Self> {
            Arc::new(Self {
                exits: Mutex::new(exits),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _command: &str) -> Result<ExecutionResult, RunnerError> {
            tokio::time::sleep(self.delay).await;
            let next = {
                let mut exits = self.exits.lock().unwrap();
                if exits.is_empty() { Some(0) } else { exits.remove(0) }
            };
            let code = next.ok_or_else(|| RunnerError::Spawn("no such file".into()))?;
            Ok(ExecutionResult {
                success: code == 0,
                exit_code: Some(code),
                stdout: String::new(),
                stderr: if code == 0 { String::new() } else { format!("failed with {code}") },
                duration: self.delay,
                timed_out: false,
            })
        }
    }

    fn store() -> Arc<InMemoryJobStore> {
        InMemoryJobStore::arc(StoreSettings {
            retry: RetryPolicy::exponential(Duration::from_millis(1), Duration::from_millis(1), 0.0),
            default_max_retries: 1,
            lease_timeout: Duration::from_secs(30),
        })
    }

    fn worker(store: Arc<InMemoryJobStore>, runner: Arc<dyn CommandRunner>) -> Worker<Arc<InMemoryJobStore>> {
        Worker::new(
            WorkerId::from_raw("w1"),
            store,
            runner,
            WorkerConfig::for_lease(Duration::from_millis(10), Duration::from_secs(30)),
        )
    }

    #[tokio::test]
    async fn idle_when_queue_is_empty() {
        let w = worker(store(), ScriptedRunner::new(vec![]));
        assert_eq!(w.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn success_completes_job() {
        let store = store();
        let id = store.enqueue(JobSpec::new("true")).await.unwrap();
        let w = worker(store.clone(), ScriptedRunner::new(vec![Some(0)]));

        assert_eq!(w.tick().await.unwrap(), TickOutcome::Completed(id.clone()));
        assert_eq!(store.get(&id).await.unwrap().unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn failures_retry_then_dead_letter() {
        let store = store();
        let id = store.enqueue(JobSpec::new("false")).await.unwrap();
        let w = worker(store.clone(), ScriptedRunner::new(vec![Some(2), None]));

        let first = w.tick().await.unwrap();
        assert!(matches!(
            first,
            TickOutcome::Failed { outcome: FailOutcome::Retrying { attempts: 1, .. }, .. }
        ));
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().last_error.as_deref(),
            Some("exit code 2: failed with 2")
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = w.tick().await.unwrap();
        assert_eq!(
            second,
            TickOutcome::Failed {
                id: id.clone(),
                outcome: FailOutcome::Dead { attempts: 2 }
            }
        );

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.last_error.as_deref(), Some("failed to spawn command: no such file"));
    }

    #[test]
    fn heartbeat_stays_inside_the_lease() {
        for lease_ms in [5, 30, 100, 30_000] {
            let lease = Duration::from_millis(lease_ms);
            let config = WorkerConfig::for_lease(Duration::from_millis(500), lease);
            assert!(config.heartbeat_interval < lease, "lease {lease:?}");
        }
        let config = WorkerConfig::for_lease(Duration::from_millis(500), MIN_LEASE_TIMEOUT);
        assert!(config.heartbeat_interval * 3 <= MIN_LEASE_TIMEOUT);
    }

    #[tokio::test]
    async fn idle_worker_stays_live_when_poll_exceeds_lease() {
        let lease = Duration::from_millis(100);
        let store = InMemoryJobStore::arc(StoreSettings {
            lease_timeout: lease,
            ..StoreSettings::default()
        });
        let w = Worker::new(
            WorkerId::from_raw("w1"),
            store.clone(),
            ScriptedRunner::new(vec![]),
            WorkerConfig::for_lease(Duration::from_millis(400), lease),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(w.run(rx));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.status().await.unwrap().active_workers, 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(store.status().await.unwrap().active_workers, 0);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_signal() {
        let store = store();
        for _ in 0..3 {
            store.enqueue(JobSpec::new("true")).await.unwrap();
        }
        let w = worker(store.clone(), ScriptedRunner::new(vec![]));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(w.run(rx));
        while store.status().await.unwrap().jobs.completed < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.status().await.unwrap().active_workers, 0);
    }
}
