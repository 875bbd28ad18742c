//! `queuectl-core` — job queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no storage, no processes):
//! identifiers, the job record and its state machine, and the retry policy.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::{ClaimToken, JobId, WorkerId};
pub use job::{Job, JobEvent, JobSpec, JobState, NewJob};
pub use retry::{RetryDecision, RetryPolicy};
