//! Purge audit trail.
//!
//! Deleted ids go to the `audit` tracing target in blocks of
//! [`DELETION_LOG_BLOCK_SIZE`] so a single line never grows unbounded.
use crate::config::Batches;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

pub const DELETION_LOG_BLOCK_SIZE: usize = 100;

/// Result of one completed batch as handed to the audit sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAuditEvent {
    pub resource: String,
    pub batch: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

pub trait AuditSink: Send + Sync {
    fn batch_completed(&self, event: &BatchAuditEvent);

    /// Records that reached the attempt limit and will not be retried.
    fn attempts_exhausted(&self, resource: &str, limit: u32, resource_ids: &[String]);

    /// A run that completed without finding anything to purge.
    fn nothing_to_purge(&self, resource: &str);
}

/// Default sink writing to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn batch_completed(&self, event: &BatchAuditEvent) {
        for (block, ids) in event.succeeded.chunks(DELETION_LOG_BLOCK_SIZE).enumerate() {
            info!(
                target: "audit",
                "Purger deleted FHIR: {}! Batch: {} Block: {} DeletedIds: {}",
                event.resource,
                event.batch,
                block + 1,
                ids.join(", ")
            );
        }
        if !event.failed.is_empty() {
            info!(
                target: "audit",
                "Purger failed to delete FHIR: {}! Batch: {} FailedIds: {}",
                event.resource,
                event.batch,
                event.failed.join(", ")
            );
        }
    }

    fn attempts_exhausted(&self, resource: &str, limit: u32, resource_ids: &[String]) {
        error!(
            target: "audit",
            "FATAL - Failed to delete {} from archive. Maximum number of attempts reached! Maximum: {} Ids: [{}]",
            resource,
            limit,
            resource_ids.join(", ")
        );
    }

    fn nothing_to_purge(&self, resource: &str) {
        info!(target: "audit", "No resources found to purge. FHIR: {}", resource);
    }
}

/// Lifecycle logging for one run of one purge.
pub(crate) struct AuditLog {
    resource: String,
    worker_id: String,
    batches: Batches,
    sink: Arc<dyn AuditSink>,
    started: Instant,
    batch_started: Instant,
}

impl AuditLog {
    pub(crate) fn new(resource: &str, worker_id: &str, batches: Batches, sink: Arc<dyn AuditSink>) -> Self {
        let now = Instant::now();
        Self {
            resource: resource.to_string(),
            worker_id: worker_id.to_string(),
            batches,
            sink,
            started: now,
            batch_started: now,
        }
    }

    pub(crate) fn start(&mut self) {
        self.started = Instant::now();
        info!(
            "Starting purging of FHIR: {}! Worker: {} Batch size: {} Batch limit: {}",
            self.resource, self.worker_id, self.batches.size, self.batches.limit
        );
    }

    pub(crate) fn start_batch(&mut self, batch: &str) {
        self.batch_started = Instant::now();
        info!("Starting batch purging of FHIR: {}! Batch: {}", self.resource, batch);
    }

    pub(crate) fn end_batch(&self, batch: &str, succeeded: Vec<String>, failed: Vec<String>) {
        let elapsed = self.batch_started.elapsed();
        info!(
            "Finished batch purging of FHIR: {}! Batch: {} Deleted: {} Failed: {} Duration: {}",
            self.resource,
            batch,
            succeeded.len(),
            failed.len(),
            format_duration(elapsed)
        );
        self.sink.batch_completed(&BatchAuditEvent {
            resource: self.resource.clone(),
            batch: batch.to_string(),
            succeeded,
            failed,
            elapsed,
        });
    }

    pub(crate) fn end_on_completion(&self, total: usize) {
        if total == 0 {
            self.sink.nothing_to_purge(&self.resource);
        }
        info!(
            "Finished purging of FHIR: {}! Total: {} Duration: {}",
            self.resource,
            total,
            format_duration(self.started.elapsed())
        );
    }

    pub(crate) fn end_on_batch_limit(&self, total: usize) {
        info!(
            "Finished purging of FHIR: {}! Batch limit of {} reached. Total: {} Duration: {}",
            self.resource,
            self.batches.limit,
            total,
            format_duration(self.started.elapsed())
        );
    }

    pub(crate) fn end_exceptionally(&self, batch: &str, total: usize, err: &dyn std::error::Error) {
        error!(
            "Purging of FHIR: {} failed! Batch: {} Total before failure: {} Duration: {} Error: {}",
            self.resource,
            batch,
            total,
            format_duration(self.started.elapsed()),
            err
        );
    }
}

/// `1d2h3m4s` style, always with every unit.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}d{}h{}m{}s",
        secs / 86_400,
        secs % 86_400 / 3_600,
        secs % 3_600 / 60,
        secs % 60
    )
}
