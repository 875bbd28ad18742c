use std::path::PathBuf;

use clap::{Parser, Subcommand};

use queuectl_core::JobState;

#[derive(Parser)]
#[command(name = "queuectl", version)]
#[command(about = "CLI-based background job queue with workers, retries, backoff, and DLQ")]
pub(crate) struct Cli {
    /// Database file (default: platform data dir, or $QUEUECTL_DB).
    #[arg(long, global = true, env = "QUEUECTL_DB")]
    pub(crate) db: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Add a job, e.g. '{"command":"echo hi"}'. Prints the job id.
    Enqueue {
        /// Job as JSON: {"command": .., "id"?: .., "run_at"?: .., "max_retries"?: ..}
        job: String,

        /// Earliest start time (RFC 3339; naive times are UTC).
        #[arg(long)]
        run_at: Option<String>,

        /// Override max retries for this job.
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Show a single job.
    Get {
        id: String,
    },
    /// Manage workers.
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Summary of job states and active workers.
    Status,
    /// List jobs, newest first.
    List {
        /// Filter by state (pending|processing|completed|failed|dead).
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Dead letter queue.
    #[command(subcommand)]
    Dlq(DlqCommand),
    /// Configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
pub(crate) enum WorkerCommand {
    /// Run workers in the foreground until Ctrl-C or `worker stop`.
    Start {
        /// Number of workers.
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Polling interval in ms (default: `poll_interval_ms` config).
        #[arg(long)]
        poll_interval: Option<u64>,
    },
    /// Ask running workers (in any process) to finish their current job and exit.
    Stop,
}

#[derive(Subcommand)]
pub(crate) enum DlqCommand {
    /// Dead jobs, most recent first.
    List,
    /// Move a dead job back to pending. Prints `enqueued` or `not-found`.
    Retry { id: String },
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommand {
    /// Print the effective value of a key.
    Get { key: String },
    /// Validate and store a value.
    Set { key: String, value: String },
    /// All keys with their effective values.
    List,
}
