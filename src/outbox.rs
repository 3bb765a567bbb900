//! Delivery of outbox records to the remote archive.
//!
//! Two entry points share [`deliver_claimed`]: the [`DeliveryDispatcher`] pool,
//! fed right after a write commits, and the periodic [`sweep_new_records`] job
//! which drains whatever the dispatcher missed (full queue, crash, restart).
//! Both claim a row before touching it, so a record is never delivered by two
//! workers at once.
use crate::archive::{ArchiveClient, ArchiveResource};
use crate::config::Delivery;
use crate::db::{self, DeliveryUpdate, OutboxRecord, Pool};
use crate::model::SyncStatus;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Deliver a record this worker has already claimed and persist the outcome.
///
/// The remote call happens outside any transaction; the outcome is written in a
/// fresh one guarded by the claim. Returns the status the record ended in.
#[instrument(skip_all, fields(resource_id = %claimed.resource_id, owner = owner))]
pub async fn deliver_claimed(
    pool: &Pool,
    client: &dyn ArchiveClient,
    claimed: &OutboxRecord,
    owner: &str,
) -> Result<SyncStatus> {
    let Some(bundle) = db::find_bundle(pool, &claimed.resource_id).await? else {
        warn!(resource_id = %claimed.resource_id, "bundle vanished before delivery");
        let update = DeliveryUpdate {
            status: SyncStatus::ERROR,
            remote_id: None,
            response_code: None,
            error: Some("bundle no longer exists locally"),
        };
        db::record_delivery(pool, claimed, owner, &update).await?;
        return Ok(SyncStatus::ERROR);
    };

    let resource = ArchiveResource {
        id: bundle.id,
        content: bundle.content,
    };
    let (status, persisted) = match client.create(&resource).await {
        Ok(outcome) => {
            let update = DeliveryUpdate {
                status: SyncStatus::SYNCED,
                remote_id: Some(&outcome.remote_id),
                response_code: Some(i64::from(outcome.status_code)),
                error: None,
            };
            let persisted = db::record_delivery(pool, claimed, owner, &update).await?;
            info!(
                resource_id = %resource.id,
                remote_id = %outcome.remote_id,
                "bundle synced to archive"
            );
            (SyncStatus::SYNCED, persisted)
        }
        Err(err) => {
            let status = err.sync_status();
            error!(resource_id = %resource.id, status = status.as_str(), "archive sync failed -> {}", err);
            let message = err.to_string();
            let update = DeliveryUpdate {
                status,
                remote_id: None,
                response_code: err.response_code().map(i64::from),
                error: Some(&message),
            };
            (status, db::record_delivery(pool, claimed, owner, &update).await?)
        }
    };

    if !persisted {
        warn!(resource_id = %resource.id, "claim lost before delivery outcome was stored");
    }
    Ok(status)
}

/// Dispatcher path: claim the record of `resource_id` and deliver it if still `NEW`.
///
/// Returns `None` when the record was already handled or is claimed by someone else.
pub async fn deliver_by_id(
    pool: &Pool,
    client: &dyn ArchiveClient,
    resource_id: &str,
    owner: &str,
    claim_timeout_secs: u64,
) -> Result<Option<SyncStatus>> {
    match db::claim_new_by_id(pool, resource_id, owner, claim_timeout_secs).await? {
        Some(claimed) => deliver_claimed(pool, client, &claimed, owner).await.map(Some),
        None => {
            debug!(resource_id, "bundle already synchronized or in flight");
            Ok(None)
        }
    }
}

/// Claim and deliver `NEW` records one at a time until none is claimable.
#[instrument(skip_all, fields(owner = owner))]
pub async fn sweep_new_records(
    pool: &Pool,
    client: &dyn ArchiveClient,
    owner: &str,
    claim_timeout_secs: u64,
) -> Result<usize> {
    info!("start sweeping new bundles to the archive");
    let mut processed = 0;
    while let Some(claimed) = db::claim_next_new(pool, owner, claim_timeout_secs).await? {
        deliver_claimed(pool, client, &claimed, owner).await?;
        processed += 1;
    }
    info!(processed, "finished sweeping");
    Ok(processed)
}

/// Run the sweeper on a fixed interval forever.
pub async fn run_sweeper(pool: Pool, client: Arc<dyn ArchiveClient>, cfg: Delivery, worker_id: String) {
    let owner = format!("{}-sweeper", worker_id);
    let mut interval = tokio::time::interval(cfg.sweeper_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(err) =
            sweep_new_records(&pool, client.as_ref(), &owner, cfg.claim_timeout_secs).await
        {
            error!(?err, "sweeper run failed");
        }
    }
}

/// Cheap handle used by writers to hand committed bundle ids to the pool.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<String>,
}

impl DispatchHandle {
    /// Queue a delivery without waiting. A full or closed queue leaves the record
    /// `NEW` for the sweeper.
    pub fn enqueue(&self, resource_id: String) -> bool {
        match self.tx.try_send(resource_id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(id)) => {
                warn!(resource_id = %id, "delivery queue full; leaving bundle for the sweeper");
                false
            }
            Err(mpsc::error::TrySendError::Closed(id)) => {
                warn!(resource_id = %id, "delivery pool stopped; leaving bundle for the sweeper");
                false
            }
        }
    }
}

/// Fixed-size worker pool with a bounded queue, isolated from the write path.
pub struct DeliveryDispatcher {
    handle: DispatchHandle,
    workers: Vec<JoinHandle<()>>,
}

impl DeliveryDispatcher {
    pub fn start(
        pool: Pool,
        client: Arc<dyn ArchiveClient>,
        cfg: &Delivery,
        worker_id: &str,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<String>(cfg.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..cfg.workers)
            .map(|n| {
                let pool = pool.clone();
                let client = client.clone();
                let rx = rx.clone();
                let owner = format!("{}-dispatch-{}", worker_id, n);
                let claim_timeout = cfg.claim_timeout_secs;
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(resource_id) = next else {
                            break;
                        };
                        if let Err(err) =
                            deliver_by_id(&pool, client.as_ref(), &resource_id, &owner, claim_timeout)
                                .await
                        {
                            error!(?err, resource_id = %resource_id, "delivery failed");
                        }
                    }
                    debug!(owner = %owner, "delivery worker stopped");
                })
            })
            .collect();
        info!(
            workers = cfg.workers,
            queue = cfg.queue_capacity,
            "archive delivery pool started"
        );
        Self {
            handle: DispatchHandle { tx },
            workers,
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Close the queue and wait for queued deliveries to finish.
    ///
    /// Handles cloned out of the dispatcher keep the queue open until dropped.
    pub async fn shutdown(self) {
        drop(self.handle);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(?err, "delivery worker panicked");
            }
        }
    }
}
