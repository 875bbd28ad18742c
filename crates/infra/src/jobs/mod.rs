//! Background job engine: durable store, workers, retry, and dead-lettering.
//!
//! ## Design
//!
//! - Jobs are shell commands with an optional earliest start time
//! - A claim is exclusive and fenced by a per-claim token
//! - Failed attempts back off exponentially, then land in the dead letter queue
//! - Abandoned claims (crashed workers) become claimable after a lease timeout
//!
//! ## Components
//!
//! - `JobStore`: atomic persistence (`SqliteJobStore`, `InMemoryJobStore`)
//! - `Worker`: claim → execute → report loop
//! - `WorkerPool`: starts and stops workers as a unit
//! - `DeadLetterQueue`: inspection and replay of dead jobs

pub mod dlq;
pub mod runner;
pub mod sqlite;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use dlq::DeadLetterQueue;
pub use runner::{CommandRunner, ExecutionResult, RunnerError, ShellCommandRunner};
pub use sqlite::SqliteJobStore;
pub use store::{
    FailOutcome, InMemoryJobStore, JobStats, JobStore, JobStoreError, Page, QueueStatus,
    StoreSettings,
};
pub use supervisor::WorkerPool;
pub use worker::{MIN_LEASE_TIMEOUT, TickOutcome, Worker, WorkerConfig};
