use super::batches::{BatchOutcome, BatchPurge, PurgeError};
use crate::db::{self, Pool};
use crate::model::ResourceKind;
use crate::retention::PeriodsCte;
use async_trait::async_trait;
use tracing::debug;

/// Deletes locally stored resources whose retention period has elapsed.
pub struct LocalExpiryPurge {
    pool: Pool,
    kind: ResourceKind,
    periods: PeriodsCte,
    batch_size: u32,
}

impl LocalExpiryPurge {
    pub fn new(pool: Pool, kind: ResourceKind, periods: PeriodsCte, batch_size: u32) -> Self {
        Self {
            pool,
            kind,
            periods,
            batch_size,
        }
    }
}

#[async_trait]
impl BatchPurge for LocalExpiryPurge {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn purge_batch(&self, batch: &str) -> Result<BatchOutcome, PurgeError> {
        let ids = db::delete_expired(&self.pool, self.kind, &self.periods, self.batch_size).await?;
        debug!(batch, deleted = ids.len(), kind = self.kind.as_str(), "expired resources deleted");
        Ok(BatchOutcome::deleted(ids))
    }
}
