//! Purge job: local expiry first, then remote reconciliation.
//!
//! Purges are registered explicitly in [`PurgeRegistry`]. [`Purger::run`]
//! executes every local purge concurrently, waits for all of them, then does
//! the same for the remote purges. A failing purge is logged and never stops
//! its siblings or the job.
pub mod audit;
pub mod batches;
pub mod local;
pub mod remote;

pub use audit::{AuditSink, BatchAuditEvent, TracingAuditSink};
pub use batches::{BatchError, BatchOutcome, BatchPurge, BatchRunner, PurgeEnd, PurgeError, PurgeReport};
pub use local::LocalExpiryPurge;
pub use remote::RemoteReconciliationPurge;

use crate::archive::ArchiveClient;
use crate::config::{Config, ConfigError};
use crate::db::Pool;
use crate::model::ResourceKind;
use crate::retention::RuleTable;
use audit::format_duration;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Local,
    Remote,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Local => "local",
            Phase::Remote => "remote",
        }
    }
}

pub struct PurgeTask {
    pub kind: ResourceKind,
    pub phase: Phase,
    pub purge: Arc<dyn BatchPurge>,
}

#[derive(Default)]
pub struct PurgeRegistry {
    tasks: Vec<PurgeTask>,
}

impl PurgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ResourceKind, phase: Phase, purge: Arc<dyn BatchPurge>) {
        self.tasks.push(PurgeTask { kind, phase, purge });
    }

    /// One local purge per resource kind, plus remote reconciliation for every
    /// archived kind when an archive client is given.
    pub fn from_config(
        cfg: &Config,
        pool: Pool,
        client: Option<Arc<dyn ArchiveClient>>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        let periods = RuleTable::compile(&cfg.purger.retention)?.to_cte();
        let size = cfg.purger.batches.size;

        let mut registry = Self::new();
        for kind in ResourceKind::ALL {
            let purge = LocalExpiryPurge::new(pool.clone(), kind, periods.clone(), size);
            registry.register(kind, Phase::Local, Arc::new(purge));
        }
        if let Some(client) = client {
            for kind in ResourceKind::ALL.into_iter().filter(|k| k.requires_archival()) {
                let purge = RemoteReconciliationPurge::new(
                    pool.clone(),
                    client.clone(),
                    cfg.purger.attempts,
                    size,
                    sink.clone(),
                );
                registry.register(kind, Phase::Remote, Arc::new(purge));
            }
        }
        Ok(registry)
    }

    pub fn tasks(&self) -> &[PurgeTask] {
        &self.tasks
    }
}

/// Outcome of one registered purge in one job run.
#[derive(Debug)]
pub struct TaskOutcome {
    pub name: String,
    pub phase: Phase,
    pub result: Result<PurgeReport, String>,
}

pub struct Purger {
    runner: BatchRunner,
    registry: PurgeRegistry,
}

impl Purger {
    pub fn new(runner: BatchRunner, registry: PurgeRegistry) -> Self {
        Self { runner, registry }
    }

    pub async fn run(&self) -> Vec<TaskOutcome> {
        let started = Instant::now();
        info!("Starting purging");
        let mut outcomes = self.run_phase(Phase::Local).await;
        outcomes.extend(self.run_phase(Phase::Remote).await);
        info!("Purging finished. Duration: {}", format_duration(started.elapsed()));
        outcomes
    }

    async fn run_phase(&self, phase: Phase) -> Vec<TaskOutcome> {
        let tasks: Vec<&PurgeTask> = self.registry.tasks.iter().filter(|t| t.phase == phase).collect();
        if tasks.is_empty() {
            info!("No purges registered for {} phase", phase.as_str());
            return Vec::new();
        }
        let names: Vec<String> = tasks.iter().map(|t| t.purge.name().to_string()).collect();
        info!("Starting {} purging phase. Purges: [{}]", phase.as_str(), names.join(", "));
        let started = Instant::now();

        let handles = tasks.iter().map(|task| {
            let runner = self.runner.clone();
            let purge = task.purge.clone();
            tokio::spawn(async move { runner.run(purge.as_ref()).await })
        });
        let joined = join_all(handles).await;

        let mut failed = false;
        let outcomes: Vec<TaskOutcome> = names
            .into_iter()
            .zip(joined)
            .map(|(name, joined)| {
                let result = match joined {
                    Ok(Ok(report)) => Ok(report),
                    Ok(Err(err)) => {
                        let message = format!("{:#}", anyhow::Error::new(err));
                        error!("Error while purging {}: {}", name, message);
                        Err(message)
                    }
                    Err(err) => {
                        error!("Purge {} aborted: {}", name, err);
                        Err(err.to_string())
                    }
                };
                failed |= result.is_err();
                TaskOutcome { name, phase, result }
            })
            .collect();

        if failed {
            error!("Purging {} phase finished with at least one error!", phase.as_str());
        }
        info!(
            "Finished {} purging phase. Duration: {}",
            phase.as_str(),
            format_duration(started.elapsed())
        );
        outcomes
    }
}
