//! Audience updater service binary.
//!
//! Runs the nightly audience reconciliation: a scheduler that fans out one task per audience
//! onto RabbitMQ and a pool of task workers that append new members and announce the change.
//! Administrative subcommands trigger a single dispatch, prune an audience or apply the store
//! migrations.

use ::config::shared::UpdaterConfig;
use clap::{Parser, Subcommand};
use telemetry::metrics::init_metrics;
use telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_updater_config;
use crate::core::run_command;
use crate::error::{UpdaterError, UpdaterResult};

mod config;
mod core;
mod error;

/// Command line of the updater.
#[derive(Debug, Parser)]
#[command(name = "audience-updater", version, about = "Nightly audience reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Default, Subcommand)]
pub enum Command {
    /// Runs the scheduler and the task workers in this process.
    #[default]
    Run,
    /// Runs only the scheduler.
    Scheduler,
    /// Runs only the task workers.
    Worker,
    /// Enqueues one reconciliation task per audience and exits.
    Trigger,
    /// Removes members whose status left the filter of an audience.
    Prune {
        #[arg(long)]
        audience_id: i64,
        /// Only report the members that would be removed.
        #[arg(long)]
        dry_run: bool,
    },
    /// Applies pending audience store migrations and exits.
    Migrate,
}

impl Command {
    /// Metrics service label for long running commands, `None` for one-shot commands.
    fn metrics_service(&self) -> Option<&'static str> {
        match self {
            Command::Run => Some("audience-updater"),
            Command::Scheduler => Some("audience-scheduler"),
            Command::Worker => Some("audience-worker"),
            Command::Trigger | Command::Prune { .. } | Command::Migrate => None,
        }
    }
}

fn main() -> UpdaterResult<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_default();

    let updater_config = load_updater_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(UpdaterError::config)?;

    if let Some(service) = command.metrics_service() {
        init_metrics(updater_config.metrics_port, service).map_err(UpdaterError::config)?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(command, updater_config))?;

    Ok(())
}

async fn async_main(command: Command, updater_config: UpdaterConfig) -> UpdaterResult<()> {
    if let Err(err) = run_command(command, updater_config).await {
        error!("{err}");
        eprint!("{}", err.render_report());

        return Err(err);
    }

    Ok(())
}
