mod cache;
mod commands;
mod config;
mod error;
mod ledger;
mod logging;
mod orchestrator;
mod reconciler;
mod registry;
mod store;
mod usage_service;

use anyhow::{Context, Result};
use clap::Parser;
use commands::Command;
use config::SyncConfig;
use std::path::PathBuf;
use usage_service::query::CancelToken;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("USAGE_SYNC_GIT_SHA"),
    ")"
);

#[derive(Parser)]
#[command(name = "usage-sync")]
#[command(about = "Collects per-user storage usage and reconciles it into the accounting store")]
#[command(version, long_version = LONG_VERSION)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// YAML config file (defaults plus environment when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SyncConfig::from_env().context("invalid default configuration")?,
    };
    let today = chrono::Local::now().date_naive();
    let log_file =
        logging::init(&config.log_dir, today).context("failed to initialise logging")?;

    let run_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("run", run_id = %run_id);
    tracing::info!(parent: &span, version = LONG_VERSION, log = %log_file.display(), "usage-sync starting");

    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        })
    };

    let command = cli.command;
    let outcome = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        commands::run(command, &config, today, cancel)
    })
    .await
    .context("command task panicked")?;
    interrupt.abort();

    match outcome {
        Ok(summary) => {
            println!("{}", summary);
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            Err(e).with_context(|| format!("see {}", log_file.display()))
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
