//! The job record, its state machine, and the enqueue schema.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ClaimToken, JobId, WorkerId};

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for `run_at`, then claimable
    Pending,
    /// Claimed by a worker
    Processing,
    /// Finished successfully (absorbing)
    Completed,
    /// Recognized for listing and counting; the engine itself never writes it
    Failed,
    /// Retries exhausted, parked in the dead letter queue
    Dead,
}

/// Events driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Claim,
    Succeed,
    /// A failed attempt; `exhausted` is the retry policy's verdict.
    Fail { exhausted: bool },
    LeaseExpired,
    DlqRetry,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// No automatic transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// The transition table. `None` means the event is not allowed from this state.
    pub fn apply(self, event: JobEvent) -> Option<JobState> {
        match (self, event) {
            (JobState::Pending, JobEvent::Claim) => Some(JobState::Processing),
            (JobState::Processing, JobEvent::Succeed) => Some(JobState::Completed),
            (JobState::Processing, JobEvent::Fail { exhausted: false }) => Some(JobState::Pending),
            (JobState::Processing, JobEvent::Fail { exhausted: true }) => Some(JobState::Dead),
            (JobState::Processing, JobEvent::LeaseExpired) => Some(JobState::Pending),
            (JobState::Dead, JobEvent::DlqRetry) => Some(JobState::Pending),
            _ => None,
        }
    }

    /// State after a claim: `pending` claims directly, an expired `processing`
    /// lease is released to `pending` and claimed again.
    pub fn claimed(self) -> Option<JobState> {
        let released = match self {
            JobState::Processing => self.apply(JobEvent::LeaseExpired)?,
            other => other,
        };
        released.apply(JobEvent::Claim)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(DomainError::invalid_state(other.to_string())),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Opaque executable payload (a shell command line).
    pub command: String,
    pub state: JobState,
    /// Not claimable before this instant.
    pub run_at: DateTime<Utc>,
    /// Execution attempts that have failed so far.
    pub attempts: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<WorkerId>,
    pub claim_token: Option<ClaimToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `pending` job from a validated spec.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            command: new.command,
            state: JobState::Pending,
            run_at: new.run_at,
            attempts: 0,
            max_retries: new.max_retries,
            last_error: None,
            claimed_by: None,
            claim_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a `processing` claim has outlived its lease at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        if self.state != JobState::Processing {
            return false;
        }
        let lease = chrono::Duration::from_std(lease_timeout).unwrap_or(chrono::Duration::MAX);
        match self.updated_at.checked_add_signed(lease) {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    /// Due pending work, or processing work whose lease expired.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        match self.state {
            JobState::Pending => self.run_at <= now,
            JobState::Processing => self.lease_expired(now, lease_timeout),
            _ => false,
        }
    }

    /// A claim is valid only while processing and the token matches.
    pub fn holds_claim(&self, token: &ClaimToken) -> bool {
        self.state == JobState::Processing && self.claim_token.as_ref() == Some(token)
    }
}

/// Caller-facing enqueue schema, as accepted from JSON.
///
/// Fields stay loosely typed here so that malformed input surfaces as a
/// validation error from [`JobSpec::validate`] rather than a parse error.
/// Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
}

/// A validated spec, ready to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: JobId,
    pub command: String,
    pub run_at: DateTime<Utc>,
    pub max_retries: u32,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    /// Parse a spec from a JSON document.
    pub fn from_json(json: &str) -> DomainResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| DomainError::validation(format!("job spec is not valid JSON: {e}")))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Schedule the job for later execution.
    pub fn with_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at.to_rfc3339());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(i64::from(max_retries));
        self
    }

    /// Validate and fill defaults. `now` is used when `run_at` is absent.
    pub fn validate(self, default_max_retries: u32, now: DateTime<Utc>) -> DomainResult<NewJob> {
        let command = match self.command {
            Some(c) if !c.trim().is_empty() => c,
            Some(_) => return Err(DomainError::validation("command must not be empty")),
            None => return Err(DomainError::validation("command is required")),
        };

        let id = match self.id {
            Some(raw) => raw
                .parse::<JobId>()
                .map_err(|e| DomainError::validation(e.to_string()))?,
            None => JobId::generate(),
        };

        let run_at = match self.run_at.as_deref() {
            Some(raw) => parse_timestamp(raw)?,
            None => now,
        };

        let max_retries = match self.max_retries {
            Some(n) if n < 0 => {
                return Err(DomainError::validation(format!(
                    "max_retries must be non-negative, got {n}"
                )));
            }
            Some(n) => u32::try_from(n)
                .map_err(|_| DomainError::validation(format!("max_retries too large: {n}")))?,
            None => default_max_retries,
        };

        Ok(NewJob {
            id,
            command,
            run_at,
            max_retries,
        })
    }
}

/// Parse an RFC 3339 timestamp; a naive date-time is read as UTC.
pub fn parse_timestamp(raw: &str) -> DomainResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(DomainError::validation(format!("run_at is not a valid timestamp: {raw:?}")))
}
