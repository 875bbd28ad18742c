//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use queuectl_core::{
    ClaimToken, DomainError, Job, JobEvent, JobId, JobSpec, JobState, RetryDecision, RetryPolicy,
    WorkerId,
};

/// Knobs the store needs to apply the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreSettings {
    pub retry: RetryPolicy,
    /// Used when a spec does not set `max_retries`.
    pub default_max_retries: u32,
    /// A `processing` job untouched for this long is claimable again.
    pub lease_timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_max_retries: 3,
            lease_timeout: Duration::from_secs(30),
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => JobStoreError::Validation(msg),
            other => JobStoreError::Validation(other.to_string()),
        }
    }
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// Back to `pending`, eligible again at `run_at`.
    Retrying { attempts: u32, run_at: DateTime<Utc> },
    /// Moved to the dead letter queue.
    Dead { attempts: u32 },
    /// The token no longer owns the job; nothing changed.
    Ignored,
}

/// Pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

/// Per-state job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl JobStats {
    pub fn record(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Processing => self.processing += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

/// Aggregate view returned by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub jobs: JobStats,
    pub active_workers: usize,
}

/// Durable job table with atomic claim semantics.
///
/// Every mutating operation is all-or-nothing. Time-dependent operations come
/// in two forms: `op_at(.., now)` takes the clock explicitly, `op(..)` uses
/// `Utc::now()`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate a spec and insert it as `pending`.
    async fn enqueue_at(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<JobId, JobStoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically take the most overdue claimable job, or `None`.
    ///
    /// Claimable means `pending` with `run_at <= now`, or `processing` with an
    /// expired lease. Two concurrent callers never receive the same job.
    async fn claim_at(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `processing -> completed` if `token` still owns the job.
    async fn complete_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Record the failure, bump `attempts`, then reschedule or dead-letter.
    async fn fail_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError>;

    /// Refresh the lease of a running claim.
    async fn heartbeat_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Newest first.
    async fn list(&self, state: Option<JobState>, page: Page) -> Result<Vec<Job>, JobStoreError>;

    /// All `dead` jobs, most recently dead-lettered first.
    async fn dlq_list(&self) -> Result<Vec<Job>, JobStoreError>;

    /// `dead -> pending` with `attempts = 0`. `false` if absent or not dead.
    async fn dlq_retry_at(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    async fn status_at(&self, now: DateTime<Utc>) -> Result<QueueStatus, JobStoreError>;

    /// Insert or refresh a worker's liveness record.
    async fn worker_heartbeat(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    async fn deregister_worker(&self, worker: &WorkerId) -> Result<(), JobStoreError>;

    /// Ask every running worker pool to shut down.
    async fn request_stop(&self, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Whether a stop was requested at or after `since`.
    async fn stop_requested_since(&self, since: DateTime<Utc>) -> Result<bool, JobStoreError>;

    async fn enqueue(&self, spec: JobSpec) -> Result<JobId, JobStoreError> {
        self.enqueue_at(spec, Utc::now()).await
    }

    async fn claim(&self, worker: &WorkerId) -> Result<Option<Job>, JobStoreError> {
        self.claim_at(worker, Utc::now()).await
    }

    async fn complete(&self, id: &JobId, token: &ClaimToken) -> Result<bool, JobStoreError> {
        self.complete_at(id, token, Utc::now()).await
    }

    async fn fail(
        &self,
        id: &JobId,
        token: &ClaimToken,
        error: &str,
    ) -> Result<FailOutcome, JobStoreError> {
        self.fail_at(id, token, error, Utc::now()).await
    }

    async fn heartbeat(&self, id: &JobId, token: &ClaimToken) -> Result<bool, JobStoreError> {
        self.heartbeat_at(id, token, Utc::now()).await
    }

    async fn dlq_retry(&self, id: &JobId) -> Result<bool, JobStoreError> {
        self.dlq_retry_at(id, Utc::now()).await
    }

    async fn status(&self) -> Result<QueueStatus, JobStoreError> {
        self.status_at(Utc::now()).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, (u64, Job)>,
    next_seq: u64,
    workers: HashMap<WorkerId, DateTime<Utc>>,
    stop_requested_at: Option<DateTime<Utc>>,
}

/// In-memory job store for tests and embedding.
///
/// A single lock guards the whole table, so select-and-transition in
/// `claim_at` is one critical section.
#[derive(Debug)]
pub struct InMemoryJobStore {
    state: RwLock<MemoryState>,
    settings: StoreSettings,
}

impl InMemoryJobStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            settings,
        }
    }

    pub fn arc(settings: StoreSettings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| JobStoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    /// Workers seen at or after this instant count as live.
    fn alive_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.settings.lease_timeout)
            .unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| JobStoreError::Unavailable("in-memory store lock poisoned".into()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

fn owned_job<'a>(
    state: &'a mut MemoryState,
    id: &JobId,
    token: &ClaimToken,
) -> Result<Option<&'a mut Job>, JobStoreError> {
    match state.jobs.get_mut(id) {
        Some((_, job)) if job.holds_claim(token) => Ok(Some(job)),
        Some(_) => Ok(None),
        None => Err(JobStoreError::NotFound(id.clone())),
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue_at(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        let new = spec.validate(self.settings.default_max_retries, now)?;
        let mut state = self.write()?;
        if state.jobs.contains_key(&new.id) {
            return Err(JobStoreError::AlreadyExists(new.id));
        }
        let id = new.id.clone();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(id.clone(), (seq, Job::from_new(new, now)));
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(id).map(|(_, job)| job.clone()))
    }

    async fn claim_at(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.write()?;
        let lease = self.settings.lease_timeout;

        // Most overdue first, stable on creation order.
        let candidate = state
            .jobs
            .values()
            .filter(|(_, j)| j.is_claimable(now, lease))
            .min_by_key(|(seq, j)| (j.run_at, j.created_at, *seq))
            .map(|(_, j)| j.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some((_, job)) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let Some(next) = job.state.claimed() else {
            return Ok(None);
        };

        job.state = next;
        job.claimed_by = Some(worker.clone());
        job.claim_token = Some(ClaimToken::generate());
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.write()?;
        let Some(job) = owned_job(&mut state, id, token)? else {
            return Ok(false);
        };
        let Some(next) = job.state.apply(JobEvent::Succeed) else {
            return Ok(false);
        };
        job.state = next;
        job.claim_token = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn fail_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        let mut state = self.write()?;
        let Some(job) = owned_job(&mut state, id, token)? else {
            return Ok(FailOutcome::Ignored);
        };

        let attempts = job.attempts.saturating_add(1);
        let decision = self.settings.retry.decide(
            attempts,
            job.max_retries,
            now,
            RetryPolicy::sample_jitter(),
        );
        let exhausted = matches!(decision, RetryDecision::Exhausted);
        let Some(next) = job.state.apply(JobEvent::Fail { exhausted }) else {
            return Ok(FailOutcome::Ignored);
        };

        job.state = next;
        job.attempts = attempts;
        job.last_error = Some(error.to_string());
        job.claim_token = None;
        job.updated_at = now;

        match decision {
            RetryDecision::Retry { run_at, .. } => {
                job.run_at = run_at;
                Ok(FailOutcome::Retrying { attempts, run_at })
            }
            RetryDecision::Exhausted => Ok(FailOutcome::Dead { attempts }),
        }
    }

    async fn heartbeat_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.write()?;
        match owned_job(&mut state, id, token)? {
            Some(job) => {
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, state: Option<JobState>, page: Page) -> Result<Vec<Job>, JobStoreError> {
        let guard = self.read()?;
        let mut rows: Vec<_> = guard
            .jobs
            .values()
            .filter(|(_, j)| state.is_none_or(|s| j.state == s))
            .collect();

        rows.sort_by(|(sa, a), (sb, b)| b.created_at.cmp(&a.created_at).then(sb.cmp(sa)));
        Ok(rows
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .map(|(_, j)| j.clone())
            .collect())
    }

    async fn dlq_list(&self) -> Result<Vec<Job>, JobStoreError> {
        let guard = self.read()?;
        let mut rows: Vec<_> = guard
            .jobs
            .values()
            .filter(|(_, j)| j.state == JobState::Dead)
            .collect();

        rows.sort_by(|(sa, a), (sb, b)| b.updated_at.cmp(&a.updated_at).then(sb.cmp(sa)));
        Ok(rows.into_iter().map(|(_, j)| j.clone()).collect())
    }

    async fn dlq_retry_at(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut state = self.write()?;
        let Some((_, job)) = state.jobs.get_mut(id) else {
            return Ok(false);
        };
        let Some(next) = job.state.apply(JobEvent::DlqRetry) else {
            return Ok(false);
        };

        job.state = next;
        job.attempts = 0;
        job.run_at = now;
        job.claimed_by = None;
        job.claim_token = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn status_at(&self, now: DateTime<Utc>) -> Result<QueueStatus, JobStoreError> {
        let guard = self.read()?;
        let mut jobs = JobStats::default();
        for (_, job) in guard.jobs.values() {
            jobs.record(job.state, 1);
        }

        let cutoff = self.alive_since(now);
        let active_workers = guard.workers.values().filter(|seen| **seen >= cutoff).count();

        Ok(QueueStatus {
            jobs,
            active_workers,
        })
    }

    async fn worker_heartbeat(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let cutoff = self.alive_since(now);
        let mut state = self.write()?;
        state.workers.retain(|_, seen| *seen >= cutoff);
        state.workers.insert(worker.clone(), now);
        Ok(())
    }

    async fn deregister_worker(&self, worker: &WorkerId) -> Result<(), JobStoreError> {
        self.write()?.workers.remove(worker);
        Ok(())
    }

    async fn request_stop(&self, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.write()?.stop_requested_at = Some(now);
        Ok(())
    }

    async fn stop_requested_since(&self, since: DateTime<Utc>) -> Result<bool, JobStoreError> {
        Ok(self.read()?.stop_requested_at.is_some_and(|at| at >= since))
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue_at(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        (**self).enqueue_at(spec, now).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn claim_at(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_at(worker, now).await
    }

    async fn complete_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).complete_at(id, token, now).await
    }

    async fn fail_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        (**self).fail_at(id, token, error, now).await
    }

    async fn heartbeat_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).heartbeat_at(id, token, now).await
    }

    async fn list(&self, state: Option<JobState>, page: Page) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(state, page).await
    }

    async fn dlq_list(&self) -> Result<Vec<Job>, JobStoreError> {
        (**self).dlq_list().await
    }

    async fn dlq_retry_at(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        (**self).dlq_retry_at(id, now).await
    }

    async fn status_at(&self, now: DateTime<Utc>) -> Result<QueueStatus, JobStoreError> {
        (**self).status_at(now).await
    }

    async fn worker_heartbeat(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).worker_heartbeat(worker, now).await
    }

    async fn deregister_worker(&self, worker: &WorkerId) -> Result<(), JobStoreError> {
        (**self).deregister_worker(worker).await
    }

    async fn request_stop(&self, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).request_stop(now).await
    }

    async fn stop_requested_since(&self, since: DateTime<Utc>) -> Result<bool, JobStoreError> {
        (**self).stop_requested_since(since).await
    }
}
