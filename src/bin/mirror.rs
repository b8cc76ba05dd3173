//! `mirror-agent` command-line entry point
//!
//! Wires configuration, logging, the object store, the two IMAP
//! connections, and the plugin set (backup sink + optional filter
//! pipeline) into a [`SyncEngine`] and runs it. A `clap` derive CLI
//! offers `run` (the default) and `print-default-config`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mirror_agent::backup::BackupSink;
use mirror_agent::config::Settings;
use mirror_agent::connection::{ImapApi, ImapConnection};
use mirror_agent::engine::SyncEngine;
use mirror_agent::filter::matcher::MatchFilter;
use mirror_agent::filter::{Filter, FilterPipeline};
use mirror_agent::object_store::{LocalObjectStore, ObjectStore};
use mirror_agent::plugin::Plugin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mirror-agent", version, about = "Mirrors and curates an IMAP mailbox onto a file share")]
struct Cli {
    /// Path to a YAML config file (defaults to `config.yml`).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync engine (default when no subcommand is given).
    Run,
    /// Print a fully documented default configuration to stdout.
    PrintDefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::PrintDefaultConfig => {
            print!("{}", serde_yaml::to_string(&Settings::example())?);
            Ok(())
        }
        Command::Run => run_daemon(cli.config.as_deref()).await,
    }
}

/// The outer restart boundary: authentication failures and
/// object-store-deadline panics both surface here, get logged, and (when
/// a run period is configured) the whole engine is rebuilt and retried
/// after that period. With no run period configured the run is one-shot
/// and a failure is fatal.
async fn run_daemon(config_path: Option<&str>) -> anyhow::Result<()> {
    loop {
        let settings = Settings::load(config_path).context("loading configuration")?;
        let run_period = settings.run_period_secs.filter(|s| *s > 0).map(Duration::from_secs);

        let outcome = tokio::spawn(run_once(settings)).await;

        let retry_after = match outcome {
            Ok(Ok(())) => break,
            Ok(Err(e)) => {
                error!(error = %e, "engine run failed");
                run_period
            }
            Err(join_err) if join_err.is_panic() => {
                error!("engine task panicked (likely an object-store deadline breach), restarting");
                run_period
            }
            Err(join_err) => {
                error!(error = %join_err, "engine task was cancelled");
                run_period
            }
        };

        match retry_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => anyhow::bail!("mirror-agent run failed and no runPeriode is configured to retry"),
        }
    }
    Ok(())
}

async fn run_once(settings: Settings) -> mirror_agent::error::Result<()> {
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new("."));

    let active: Arc<dyn ImapApi> = Arc::new(ImapConnection::new(settings.imap.clone()));
    let idle: Arc<dyn ImapApi> = Arc::new(ImapConnection::new(settings.imap.clone()));

    let mut plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(BackupSink::new(store.clone(), settings.backup.backup_dir.clone()))];

    if let Some(scripts_dir) = &settings.filter.scripts_dir {
        let matcher = MatchFilter::load(store.as_ref(), scripts_dir).await?;
        let filters: Vec<Box<dyn Filter>> = vec![Box::new(matcher)];
        plugins.push(Arc::new(FilterPipeline::new(filters, settings.filter.quarantine_folder.clone())));
    }

    let mut engine = SyncEngine::new(
        active,
        idle,
        store,
        plugins,
        settings.state.state_dir.clone(),
        settings.state.state_file.clone(),
        settings.state.last_message_offset,
    );

    engine.init_plugins().await;
    info!("mirror-agent starting sweep loop");
    let run_period = settings.run_period_secs.filter(|s| *s > 0).map(Duration::from_secs);
    engine.run(run_period).await;
    Ok(())
}

