//! SQLite-backed job store.
//!
//! Durable across restarts: workers in any process that open the same file
//! share one queue.
//!
//! ## Atomicity
//!
//! Every state transition is a single conditional `UPDATE`:
//!
//! | Operation | Guard |
//! |-----------|-------|
//! | `claim` | row is due `pending`, or `processing` with `updated_at` older than the lease |
//! | `complete` / `heartbeat` | `state = 'processing' AND claim_token = ?` |
//! | `fail` | `state = 'processing' AND claim_token = ? AND attempts = ?` |
//! | `dlq_retry` | `state = 'dead'` |
//!
//! The guards encode the `JobState::apply` transition table: each `SET state`
//! writes the state that table yields for the event, and the `WHERE` clause
//! rejects rows the table has no transition for.
//!
//! `claim` selects its candidate in a subquery of the same statement, so the
//! read and the write happen under one write lock; there is no
//! read-then-write window for a second poller to slip into.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{
    ClaimToken, Job, JobId, JobSpec, JobState, RetryDecision, RetryPolicy, WorkerId,
};

use super::store::{FailOutcome, JobStats, JobStore, JobStoreError, Page, QueueStatus, StoreSettings};
use crate::db::{self, duration_millis, from_millis, is_unique_violation, map_sqlx_error, to_millis};

const STOP_REQUESTED_AT: &str = "stop_requested_at";

/// SQLite-backed job store. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    settings: StoreSettings,
}

impl SqliteJobStore {
    /// Wrap an existing pool. The schema must already exist (see [`db::init_schema`]).
    pub fn new(pool: SqlitePool, settings: StoreSettings) -> Self {
        Self { pool, settings }
    }

    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path, settings: StoreSettings) -> Result<Self, JobStoreError> {
        let pool = db::open(path).await?;
        Ok(Self::new(pool, settings))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    async fn exists(&self, id: &JobId) -> Result<bool, JobStoreError> {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }

    /// Workers whose heartbeat is at or after this (ms) count as live.
    fn alive_since(&self, now: DateTime<Utc>) -> i64 {
        to_millis(now).saturating_sub(duration_millis(self.settings.lease_timeout))
    }

    /// Distinguish "token lost" (false) from "no such job" (NotFound).
    async fn lost_or_missing(&self, id: &JobId) -> Result<bool, JobStoreError> {
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(JobStoreError::NotFound(id.clone()))
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, spec), err)]
    async fn enqueue_at(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        let new = spec.validate(self.settings.default_max_retries, now)?;
        let job = Job::from_new(new, now);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id,
                command,
                state,
                run_at,
                attempts,
                max_retries,
                last_error,
                claimed_by,
                claim_token,
                created_at,
                updated_at
            )
            VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, NULL, NULL, ?6, ?6)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(to_millis(job.run_at))
        .bind(i64::from(job.max_retries))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id.clone())
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        debug!(job_id = %job.id, run_at = %job.run_at, "job enqueued");
        Ok(job.id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_at(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let now_ms = to_millis(now);
        let stale_before = now_ms.saturating_sub(duration_millis(self.settings.lease_timeout));
        let token = ClaimToken::generate();

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing',
                claimed_by = ?1,
                claim_token = ?2,
                updated_at = ?3
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE (state = 'pending' AND run_at <= ?3)
                   OR (state = 'processing' AND updated_at <= ?4)
                ORDER BY run_at ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
              AND (
                   (state = 'pending' AND run_at <= ?3)
                OR (state = 'processing' AND updated_at <= ?4)
              )
            RETURNING *
            "#,
        )
        .bind(worker.as_str())
        .bind(token.as_str())
        .bind(now_ms)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self, token), err)]
    async fn complete_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                claim_token = NULL,
                updated_at = ?3
            WHERE id = ?1 AND state = 'processing' AND claim_token = ?2
            "#,
        )
        .bind(id.as_str())
        .bind(token.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.lost_or_missing(id).await
    }

    #[instrument(skip(self, token, error), err)]
    async fn fail_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        let Some(job) = self.get(id).await? else {
            return Err(JobStoreError::NotFound(id.clone()));
        };
        if !job.holds_claim(token) {
            return Ok(FailOutcome::Ignored);
        }

        let attempts = job.attempts.saturating_add(1);
        let decision = self.settings.retry.decide(
            attempts,
            job.max_retries,
            now,
            RetryPolicy::sample_jitter(),
        );
        let (state, run_at, outcome) = match decision {
            RetryDecision::Retry { run_at, .. } => (
                JobState::Pending,
                run_at,
                FailOutcome::Retrying { attempts, run_at },
            ),
            RetryDecision::Exhausted => (JobState::Dead, job.run_at, FailOutcome::Dead { attempts }),
        };

        // `attempts` in the guard pins the row to the version the decision was made on.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?4,
                attempts = ?5,
                run_at = ?6,
                last_error = ?7,
                claim_token = NULL,
                updated_at = ?8
            WHERE id = ?1 AND state = 'processing' AND claim_token = ?2 AND attempts = ?3
            "#,
        )
        .bind(id.as_str())
        .bind(token.as_str())
        .bind(i64::from(job.attempts))
        .bind(state.as_str())
        .bind(i64::from(attempts))
        .bind(to_millis(run_at))
        .bind(error)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        if result.rows_affected() == 1 {
            Ok(outcome)
        } else {
            Ok(FailOutcome::Ignored)
        }
    }

    async fn heartbeat_at(
        &self,
        id: &JobId,
        token: &ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET updated_at = ?3
            WHERE id = ?1 AND state = 'processing' AND claim_token = ?2
            "#,
        )
        .bind(id.as_str())
        .bind(token.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.lost_or_missing(id).await
    }

    async fn list(&self, state: Option<JobState>, page: Page) -> Result<Vec<Job>, JobStoreError> {
        let limit = i64::try_from(page.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT *
            FROM jobs
            WHERE ?1 IS NULL OR state = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(state.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn dlq_list(&self) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM jobs
            WHERE state = 'dead'
            ORDER BY updated_at DESC, rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("dlq_list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn dlq_retry_at(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                run_at = ?2,
                claimed_by = NULL,
                claim_token = NULL,
                updated_at = ?2
            WHERE id = ?1 AND state = 'dead'
            "#,
        )
        .bind(id.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("dlq_retry", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn status_at(&self, now: DateTime<Utc>) -> Result<QueueStatus, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("status", e))?;

        let mut jobs = JobStats::default();
        for row in &rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("status", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("status", e))?;
            let state = state.parse::<JobState>().map_err(corrupt)?;
            jobs.record(state, usize::try_from(n).unwrap_or(0));
        }

        let alive_since = self.alive_since(now);
        let (active,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workers WHERE heartbeat_at >= ?1")
                .bind(alive_since)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("status", e))?;

        Ok(QueueStatus {
            jobs,
            active_workers: usize::try_from(active).unwrap_or(0),
        })
    }

    async fn worker_heartbeat(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        // Rows of workers that died without deregistering.
        sqlx::query("DELETE FROM workers WHERE heartbeat_at < ?1")
            .bind(self.alive_since(now))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("worker_heartbeat", e))?;

        sqlx::query(
            r#"
            INSERT INTO workers (id, pid, heartbeat_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at
            "#,
        )
        .bind(worker.as_str())
        .bind(i64::from(std::process::id()))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("worker_heartbeat", e))?;
        Ok(())
    }

    async fn deregister_worker(&self, worker: &WorkerId) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM workers WHERE id = ?1")
            .bind(worker.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("deregister_worker", e))?;
        Ok(())
    }

    async fn request_stop(&self, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO control (name, value)
            VALUES (?1, ?2)
            ON CONFLICT (name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(STOP_REQUESTED_AT)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("request_stop", e))?;
        Ok(())
    }

    async fn stop_requested_since(&self, since: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let value: Option<(i64,)> = sqlx::query_as("SELECT value FROM control WHERE name = ?1")
            .bind(STOP_REQUESTED_AT)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stop_requested_since", e))?;

        Ok(value.is_some_and(|(at,)| at >= to_millis(since)))
    }
}

fn corrupt(err: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Unavailable(format!("corrupt job row: {err}"))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let get_err = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let state: String = row.try_get("state").map_err(get_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(get_err)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(get_err)?;
    let claimed_by: Option<String> = row.try_get("claimed_by").map_err(get_err)?;
    let claim_token: Option<String> = row.try_get("claim_token").map_err(get_err)?;

    Ok(Job {
        id: JobId::from_raw(row.try_get::<String, _>("id").map_err(get_err)?),
        command: row.try_get("command").map_err(get_err)?,
        state: state.parse().map_err(corrupt)?,
        run_at: from_millis(row.try_get("run_at").map_err(get_err)?)?,
        attempts: u32::try_from(attempts).map_err(corrupt)?,
        max_retries: u32::try_from(max_retries).map_err(corrupt)?,
        last_error: row.try_get("last_error").map_err(get_err)?,
        claimed_by: claimed_by.map(WorkerId::from_raw),
        claim_token: claim_token.map(ClaimToken::from_raw),
        created_at: from_millis(row.try_get("created_at").map_err(get_err)?)?,
        updated_at: from_millis(row.try_get("updated_at").map_err(get_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn settings() -> StoreSettings {
        StoreSettings {
            retry: RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60), 0.0),
            default_max_retries: 3,
            lease_timeout: Duration::from_secs(30),
        }
    }

    async fn temp_store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(&dir.path().join("queue.db"), settings())
            .await
            .unwrap();
        (dir, store)
    }

    fn worker(n: usize) -> WorkerId {
        WorkerId::from_raw(format!("w{n}"))
    }

    #[tokio::test]
    async fn enqueue_then_claim_round_trip() {
        let (_dir, store) = temp_store().await;

        let id = store.enqueue(JobSpec::new("echo hi")).await.unwrap();
        let job = store.claim(&worker(1)).await.unwrap().unwrap();

        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.command, "echo hi");
        assert_eq!(job.claimed_by, Some(worker(1)));
        assert!(store.claim(&worker(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicates_and_invalid_specs() {
        let (_dir, store) = temp_store().await;
        store.enqueue(JobSpec::new("true").with_id("job1")).await.unwrap();

        assert!(matches!(
            store.enqueue(JobSpec::new("true").with_id("job1")).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.enqueue(JobSpec::default()).await,
            Err(JobStoreError::Validation(_))
        ));
        assert_eq!(store.status().await.unwrap().jobs.total(), 1);
    }

    #[tokio::test]
    async fn claim_orders_by_run_at_then_created_at() {
        let (_dir, store) = temp_store().await;
        let t0 = Utc::now();

        store.enqueue_at(JobSpec::new("a").with_id("a"), t0).await.unwrap();
        store.enqueue_at(JobSpec::new("b").with_id("b"), t0).await.unwrap();
        store
            .enqueue_at(
                JobSpec::new("c")
                    .with_id("c")
                    .with_run_at(t0 - chrono::Duration::minutes(1)),
                t0,
            )
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = store.claim_at(&worker(1), t0).await.unwrap() {
            order.push(job.id.into_inner());
        }
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn complete_and_fail_ignore_stale_tokens() {
        let (_dir, store) = temp_store().await;
        let id = store.enqueue(JobSpec::new("true")).await.unwrap();
        store.claim(&worker(1)).await.unwrap().unwrap();

        let stale = ClaimToken::generate();
        assert!(!store.complete(&id, &stale).await.unwrap());
        assert_eq!(store.fail(&id, &stale, "x").await.unwrap(), FailOutcome::Ignored);
        assert!(!store.heartbeat(&id, &stale).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap().unwrap().state, JobState::Processing);

        let missing = JobId::from_raw("nope");
        assert!(matches!(
            store.complete(&missing, &stale).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fail_moves_to_dead_after_max_retries() {
        let (_dir, store) = temp_store().await;
        let mut now = Utc::now();
        let id = store
            .enqueue_at(JobSpec::new("false").with_max_retries(1), now)
            .await
            .unwrap();

        let job = store.claim_at(&worker(1), now).await.unwrap().unwrap();
        let outcome = store
            .fail_at(&id, job.claim_token.as_ref().unwrap(), "exit code 1", now)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { attempts: 1, .. }));

        now += chrono::Duration::seconds(1);
        let job = store.claim_at(&worker(1), now).await.unwrap().unwrap();
        let outcome = store
            .fail_at(&id, job.claim_token.as_ref().unwrap(), "exit code 2", now)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Dead { attempts: 2 });

        let dead = store.dlq_list().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("exit code 2"));
        assert!(store.claim_at(&worker(1), now + chrono::Duration::days(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dlq_retry_resets_attempts() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        let id = store
            .enqueue_at(JobSpec::new("false").with_max_retries(0), now)
            .await
            .unwrap();
        let job = store.claim_at(&worker(1), now).await.unwrap().unwrap();
        store
            .fail_at(&id, job.claim_token.as_ref().unwrap(), "boom", now)
            .await
            .unwrap();

        assert!(store.dlq_retry(&id).await.unwrap());
        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.claim_token.is_none());
        assert!(job.claimed_by.is_none());

        // Second retry: no longer dead
        assert!(!store.dlq_retry(&id).await.unwrap());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let id = {
            let store = SqliteJobStore::open(&path, settings()).await.unwrap();
            let id = store.enqueue(JobSpec::new("echo persisted")).await.unwrap();
            store.pool().close().await;
            id
        };

        let store = SqliteJobStore::open(&path, settings()).await.unwrap();
        let job = store.claim(&worker(1)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.command, "echo persisted");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_share_a_job() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        for i in 0..40 {
            store.enqueue(JobSpec::new(format!("echo {i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(job) = store.claim(&worker(w)).await.unwrap() {
                    got.push(job.id);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }

    #[tokio::test]
    async fn stale_worker_rows_are_pruned() {
        let (_dir, store) = temp_store().await;
        let t0 = Utc::now();

        store.worker_heartbeat(&worker(1), t0).await.unwrap();
        store.worker_heartbeat(&worker(2), t0).await.unwrap();
        let later = t0 + chrono::Duration::seconds(31);
        store.worker_heartbeat(&worker(3), later).await.unwrap();

        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM workers ORDER BY id")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(ids, vec![("w3".to_string(),)]);
        assert_eq!(store.status_at(later).await.unwrap().active_workers, 1);
    }
}
