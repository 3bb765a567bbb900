//! Removes archived copies of bundles that no longer exist locally.
use super::audit::AuditSink;
use super::batches::{BatchOutcome, BatchPurge, PurgeError};
use crate::archive::{ArchiveClient, DeleteItem};
use crate::config::Attempts;
use crate::db::{self, ClaimedRecord, Pool};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const ARCHIVE_PURGE_NAME: &str = "archive-bundle";

pub struct RemoteReconciliationPurge {
    pool: Pool,
    client: Arc<dyn ArchiveClient>,
    attempts: Attempts,
    batch_size: u32,
    sink: Arc<dyn AuditSink>,
}

impl RemoteReconciliationPurge {
    pub fn new(
        pool: Pool,
        client: Arc<dyn ArchiveClient>,
        attempts: Attempts,
        batch_size: u32,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            pool,
            client,
            attempts,
            batch_size,
            sink,
        }
    }

    /// Split failed records into retryable and exhausted and log both.
    fn log_failed_attempts(&self, failed: &[FailedRecord<'_>]) {
        let limit = i64::from(self.attempts.limit);
        let (exhausted, retryable): (Vec<&FailedRecord>, Vec<&FailedRecord>) =
            failed.iter().partition(|f| f.record.attempt >= limit);

        if !retryable.is_empty() {
            warn!(
                "Failed to delete bundles from archive. Attempt counter raised. Bundles: [{}]",
                retryable
                    .iter()
                    .map(|f| format!("{} (attempt {}: {})", f.record.resource_id, f.record.attempt, f.reason))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if !exhausted.is_empty() {
            let ids: Vec<String> = exhausted.iter().map(|f| f.record.resource_id.clone()).collect();
            self.sink.attempts_exhausted(ARCHIVE_PURGE_NAME, self.attempts.limit, &ids);
        }
    }

    async fn release(&self, batch: &str) {
        if let Err(err) = db::release_claims(&self.pool, batch).await {
            error!(?err, batch, "failed to release reconciliation claims");
        }
    }
}

struct FailedRecord<'a> {
    record: &'a ClaimedRecord,
    reason: String,
}

/// Records whose delete failed or got no response item at all.
fn failed_records<'a>(claimed: &'a [ClaimedRecord], items: &[DeleteItem]) -> Vec<FailedRecord<'a>> {
    let by_remote: HashMap<&str, &DeleteItem> =
        items.iter().map(|item| (item.remote_id.as_str(), item)).collect();
    claimed
        .iter()
        .filter_map(|record| {
            let reason = match by_remote.get(record.remote_id.as_str()) {
                None => "no response entry".to_string(),
                Some(item) if item.is_failure() => match &item.detail {
                    Some(detail) => format!("status {}, {}", item.status_code, detail),
                    None => format!("status {}", item.status_code),
                },
                Some(_) => return None,
            };
            Some(FailedRecord { record, reason })
        })
        .collect()
}

#[async_trait]
impl BatchPurge for RemoteReconciliationPurge {
    fn name(&self) -> &str {
        ARCHIVE_PURGE_NAME
    }

    async fn purge_batch(&self, batch: &str) -> Result<BatchOutcome, PurgeError> {
        let claimed = db::claim_for_reconciliation(
            &self.pool,
            batch,
            self.attempts.limit,
            self.attempts.timeout_minutes,
            self.batch_size,
        )
        .await?;
        info!("Loaded bundles for purging. Batch: {} Bundles: {}", batch, claimed.len());
        if claimed.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let remote_ids: Vec<String> = claimed.iter().map(|r| r.remote_id.clone()).collect();
        let items = match self.client.batch_delete(&remote_ids).await {
            Ok(items) => items,
            Err(err) => {
                let reason = err.to_string();
                let failed: Vec<FailedRecord> = claimed
                    .iter()
                    .map(|record| FailedRecord { record, reason: reason.clone() })
                    .collect();
                self.log_failed_attempts(&failed);
                self.release(batch).await;
                return Err(err.into());
            }
        };

        let failed = failed_records(&claimed, &items);
        self.log_failed_attempts(&failed);
        if failed.len() == claimed.len() {
            self.release(batch).await;
            return Err(PurgeError::AllFailed { count: failed.len() });
        }

        let failed: Vec<String> = failed.iter().map(|f| f.record.resource_id.clone()).collect();
        let processed: Vec<String> = claimed.iter().map(|r| r.resource_id.clone()).collect();
        let succeeded: Vec<String> = processed
            .iter()
            .filter(|id| !failed.contains(id))
            .cloned()
            .collect();
        db::finish_reconciliation(&self.pool, batch, &succeeded).await?;
        Ok(BatchOutcome { processed, failed })
    }
}
