//! Subcommand handlers. Results go to stdout; logs go to stderr.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use queuectl_core::{JobId, JobSpec};
use queuectl_infra::jobs::{Page, SqliteJobStore};
use queuectl_infra::{ConfigKey, JobQueue};

use crate::cli::{Command, ConfigCommand, DlqCommand, WorkerCommand};

pub(crate) async fn run(db: &Path, command: Command) -> Result<()> {
    let queue = JobQueue::open(db)
        .await
        .with_context(|| format!("failed to open job database at {}", db.display()))?;

    match command {
        Command::Enqueue {
            job,
            run_at,
            max_retries,
        } => {
            let mut spec = JobSpec::from_json(&job)?;
            if let Some(run_at) = run_at {
                spec.run_at = Some(run_at);
            }
            if let Some(n) = max_retries {
                spec = spec.with_max_retries(n);
            }
            let id = queue.enqueue(spec).await?;
            println!("{id}");
        }
        Command::Get { id } => {
            let job = queue.get(&JobId::from_raw(id)).await?;
            print_json(&job)?;
        }
        Command::Worker(WorkerCommand::Start {
            count,
            poll_interval,
        }) => {
            let ids = queue
                .start_workers(count, poll_interval.map(Duration::from_millis))
                .await?;
            info!(count = ids.len(), "workers running; Ctrl-C or `queuectl worker stop` to stop");

            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl-C")?;
                    info!("interrupt received, finishing in-flight jobs");
                }
                _ = queue.workers_stopping() => {}
            }
            queue.stop_workers().await;
        }
        Command::Worker(WorkerCommand::Stop) => {
            queue.request_stop().await?;
            println!("stop requested");
        }
        Command::Status => {
            print_json(&queue.get_status().await?)?;
        }
        Command::List {
            state,
            limit,
            offset,
        } => {
            let jobs = queue.list_jobs(state, Page::new(limit, offset)).await?;
            print_json(&jobs)?;
        }
        Command::Dlq(DlqCommand::List) => {
            print_json(&queue.dlq_list().await?)?;
        }
        Command::Dlq(DlqCommand::Retry { id }) => {
            let retried = queue.dlq_retry(&JobId::from_raw(id)).await?;
            println!("{}", if retried { "enqueued" } else { "not-found" });
        }
        Command::Config(cmd) => config(&queue, cmd).await?,
    }

    Ok(())
}

async fn config(
    queue: &JobQueue<SqliteJobStore>,
    cmd: ConfigCommand,
) -> Result<()> {
    let store = queue.config_store();
    match cmd {
        ConfigCommand::Get { key } => {
            let key: ConfigKey = key.parse()?;
            println!("{}", store.effective(key).await?);
        }
        ConfigCommand::Set { key, value } => {
            let key: ConfigKey = key.parse()?;
            store.set(key, &value).await?;
            println!("ok");
        }
        ConfigCommand::List => {
            print_json(&store.list().await?)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
