use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> ExitCode {
    queuectl_observability::init();

    let cli = cli::Cli::parse();
    let db = cli
        .db
        .unwrap_or_else(queuectl_infra::default_database_path);

    match commands::run(&db, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
