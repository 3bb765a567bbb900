//! Transactional resource writes with outbox records.
use crate::db::{self, Pool};
use crate::model::{Resource, ValidationError};
use crate::outbox::DispatchHandle;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("resource {index} is invalid: {source}")]
    Invalid {
        index: usize,
        #[source]
        source: ValidationError,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Writes resources and their outbox records in one transaction, then hands the
/// committed bundle ids to the delivery pool.
#[derive(Clone)]
pub struct ResourceWriter {
    pool: Pool,
    archival: bool,
    dispatch: Option<DispatchHandle>,
}

impl ResourceWriter {
    /// Writer for an active archive. Without a dispatch handle the sweeper delivers.
    pub fn new(pool: Pool, dispatch: Option<DispatchHandle>) -> Self {
        Self {
            pool,
            archival: true,
            dispatch,
        }
    }

    /// Writer for a disabled archive: resources are stored, no outbox records are created.
    pub fn local_only(pool: Pool) -> Self {
        Self {
            pool,
            archival: false,
            dispatch: None,
        }
    }

    /// Store a batch of resources atomically. Returns `Kind/<id>` references in input order.
    ///
    /// Nothing is written when any resource fails validation or any insert fails;
    /// deliveries are only queued once the transaction has committed.
    #[instrument(skip_all, fields(count = resources.len()))]
    pub async fn store(&self, resources: &[Resource]) -> Result<Vec<String>, WriteError> {
        let mut records = Vec::with_capacity(resources.len());
        for (index, resource) in resources.iter().enumerate() {
            let handler = resource.kind().handler();
            (handler.validate)(resource).map_err(|source| WriteError::Invalid { index, source })?;
            let record =
                (handler.to_record)(resource).map_err(|source| WriteError::Invalid { index, source })?;
            records.push(record);
        }

        let mut references = Vec::with_capacity(resources.len());
        let mut after_commit = Vec::new();
        let mut tx = self.pool.begin().await?;
        for (resource, record) in resources.iter().zip(&records) {
            let kind = resource.kind();
            let id = Uuid::new_v4().to_string();
            db::insert_resource_tx(&mut tx, &id, resource.meta(), record).await?;
            if self.archival && kind.requires_archival() {
                db::create_outbox_tx(&mut tx, &id).await?;
                after_commit.push(id.clone());
            }
            references.push(format!("{}/{}", kind.resource_type(), id));
        }
        tx.commit().await?;
        info!(stored = references.len(), archived = after_commit.len(), "resources stored");

        match &self.dispatch {
            Some(dispatch) => {
                for id in after_commit {
                    dispatch.enqueue(id);
                }
            }
            None if !after_commit.is_empty() => {
                debug!(pending = after_commit.len(), "no delivery pool; leaving bundles for the sweeper")
            }
            None => {}
        }
        Ok(references)
    }
}
