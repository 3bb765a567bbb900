//! Batch loop shared by every purge.
use super::audit::{AuditLog, AuditSink};
use crate::archive::ArchiveError;
use crate::config::Batches;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Ids handled by one batch. `failed` is a subset of `processed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: Vec<String>,
    pub failed: Vec<String>,
}

impl BatchOutcome {
    pub fn deleted(ids: Vec<String>) -> Self {
        Self {
            processed: ids,
            failed: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> Vec<String> {
        self.processed
            .iter()
            .filter(|id| !self.failed.contains(id))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("all {count} records of the batch failed to be deleted from the archive")]
    AllFailed { count: usize },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
#[error("failed to purge batch {batch}")]
pub struct BatchError {
    pub batch: String,
    /// Records purged by earlier batches of the same run.
    pub total: usize,
    #[source]
    pub source: PurgeError,
}

/// One kind of purge, invoked once per batch.
#[async_trait]
pub trait BatchPurge: Send + Sync {
    /// Resource name used in logs and the audit trail.
    fn name(&self) -> &str;

    /// Purge at most one batch worth of records. `batch` also serves as claim owner.
    async fn purge_batch(&self, batch: &str) -> Result<BatchOutcome, PurgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeEnd {
    /// A batch came back short; nothing eligible is left.
    Completed,
    BatchLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub resource: String,
    pub total: usize,
    pub batches: u32,
    pub end: PurgeEnd,
}

/// Runs a [`BatchPurge`] batch after batch until it comes back short or the
/// configured batch limit is hit.
#[derive(Clone)]
pub struct BatchRunner {
    worker_id: String,
    batches: Batches,
    sink: Arc<dyn AuditSink>,
}

impl BatchRunner {
    pub fn new(worker_id: impl Into<String>, batches: Batches, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            worker_id: worker_id.into(),
            batches,
            sink,
        }
    }

    pub fn batch_label(&self, iteration: u32) -> String {
        format!("{}-batch-{}", self.worker_id, iteration)
    }

    pub async fn run(&self, purge: &dyn BatchPurge) -> Result<PurgeReport, BatchError> {
        let mut audit = AuditLog::new(purge.name(), &self.worker_id, self.batches, self.sink.clone());
        audit.start();

        let size = self.batches.size as usize;
        let mut total = 0;
        let mut iteration = 0u32;
        loop {
            iteration += 1;
            let batch = self.batch_label(iteration);
            audit.start_batch(&batch);

            let outcome = match purge.purge_batch(&batch).await {
                Ok(outcome) => outcome,
                Err(source) => {
                    audit.end_exceptionally(&batch, total, &source);
                    return Err(BatchError { batch, total, source });
                }
            };
            let succeeded = outcome.succeeded();
            let deleted = succeeded.len();
            total += deleted;
            audit.end_batch(&batch, succeeded, outcome.failed);

            let report = |end| PurgeReport {
                resource: purge.name().to_string(),
                total,
                batches: iteration,
                end,
            };
            if deleted < size {
                audit.end_on_completion(total);
                return Ok(report(PurgeEnd::Completed));
            }
            if iteration == self.batches.limit {
                audit.end_on_batch_limit(total);
                return Ok(report(PurgeEnd::BatchLimit));
            }
        }
    }
}
