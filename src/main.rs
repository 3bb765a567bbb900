use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use notification_archive::archive::{ArchiveClient, HttpArchiveClient};
use notification_archive::config;
use notification_archive::db;
use notification_archive::outbox;
use notification_archive::purge::{BatchRunner, PurgeRegistry, Purger, TracingAuditSink};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sweep pending bundles to the archive until interrupted
    Sync,
    /// Run the local and remote purges once and exit
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let worker_id = cfg.worker_id();

    match args.command {
        Command::Sync => {
            if !cfg.archive.enabled {
                warn!("archive is disabled; nothing to sync");
                return Ok(());
            }
            let client: Arc<dyn ArchiveClient> = Arc::new(HttpArchiveClient::from_config(&cfg)?);
            let sweeper = tokio::spawn(outbox::run_sweeper(
                pool.clone(),
                client,
                cfg.delivery.clone(),
                worker_id.clone(),
            ));

            info!(worker_id = %worker_id, "archive sync running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            sweeper.abort();
        }
        Command::Purge => {
            if !cfg.purger.enabled {
                warn!("Purging job is disabled");
                return Ok(());
            }
            let client: Option<Arc<dyn ArchiveClient>> = if cfg.archive.enabled {
                Some(Arc::new(HttpArchiveClient::from_config(&cfg)?))
            } else {
                None
            };
            let sink = Arc::new(TracingAuditSink);
            let registry = PurgeRegistry::from_config(&cfg, pool.clone(), client, sink.clone())?;
            let runner = BatchRunner::new(worker_id, cfg.purger.batches, sink);
            let outcomes = Purger::new(runner, registry).run().await;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(report) => info!(
                        purge = %outcome.name,
                        phase = outcome.phase.as_str(),
                        total = report.total,
                        batches = report.batches,
                        "purge finished"
                    ),
                    Err(err) => error!(purge = %outcome.name, phase = outcome.phase.as_str(), %err, "purge failed"),
                }
            }
        }
    }

    Ok(())
}
