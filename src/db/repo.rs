use super::compress::{gunzip, gunzip_string, gzip};
use super::model::{ClaimedRecord, OutboxRecord, StoredBinary, StoredBundle};
use crate::model::{NewRecord, ResourceKind, ResourceMeta, SyncStatus};
use crate::retention::{PeriodBind, PeriodsCte};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

/// Expired-record delete, prefixed at runtime by the `periods` common table.
///
/// The default period is always joined; department (and for bundles, profile)
/// overrides are left-joined and the most specific one wins via `COALESCE`.
/// Selection and deletion are one statement so concurrent writers cannot race it.
const EXPIRED_DELETE: &str = "
DELETE
  FROM ${TABLE}
 WHERE id IN (
  SELECT id
    FROM (
      SELECT r.id,
             r.last_updated,
             ${PERIOD} AS period_applied
        FROM ${TABLE} r
        JOIN periods p1 ON p1.rule = 'default-period'
        LEFT JOIN periods p2 ON p2.rule = 'responsible-department' AND r.responsible_department = p2.value
        ${PROFILE_JOIN}
        ) AS r1
   WHERE CAST(julianday('now') - julianday(r1.last_updated) AS INTEGER) >= r1.period_applied
   LIMIT ?
 )
RETURNING id";

/// Bulk claim of outbox rows whose bundle is gone locally but still exists remotely.
///
/// A row qualifies when it has never been attempted and is unclaimed, or when
/// its last claim is at least `timeout` minutes old; in both cases only while
/// `attempt` is below the limit. Exhausted rows are never selected again.
const RECONCILIATION_CLAIM: &str = "
UPDATE outbox
   SET claim_owner = ?,
       claimed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
       attempt = attempt + 1
 WHERE resource_id IN (
    SELECT o.resource_id
      FROM outbox o
      LEFT JOIN bundles b ON o.resource_id = b.id
     WHERE b.id IS NULL
       AND o.remote_id IS NOT NULL
       AND o.attempt < ?
       AND ((o.claim_owner IS NULL AND o.attempt = 0)
            OR CAST((julianday('now') - julianday(o.claimed_at)) * 1440 AS INTEGER) >= ?)
     LIMIT ?
 )
RETURNING resource_id, remote_id, attempt";

/// Single-row delivery claim. Rows carrying a live claim are skipped, never waited on.
const DELIVERY_CLAIM: &str = "
UPDATE outbox
   SET claim_owner = ?,
       claimed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
 WHERE resource_id = (
    SELECT resource_id
      FROM outbox
     WHERE status = 'NEW'
       AND ${TARGET}
       AND (claim_owner IS NULL
            OR CAST((julianday('now') - julianday(claimed_at)) * 86400 AS INTEGER) >= ?)
     LIMIT 1
 )
RETURNING resource_id, status, version, remote_id, response_code, error, claim_owner, claimed_at, attempt";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        // WAL with stricter durability.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Resource store

/// Insert one resource row. Must run inside the caller's transaction.
///
/// Bundle content and binary data are stored gzip-compressed.
#[instrument(skip_all, fields(id = id))]
pub async fn insert_resource_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    meta: &ResourceMeta,
    record: &NewRecord,
) -> Result<()> {
    let tags = serde_json::to_string(&meta.tags).context("failed to encode tags")?;
    match record {
        NewRecord::Bundle {
            profile,
            notification_bundle_id,
            notification_id,
            content,
        } => {
            sqlx::query(
                "INSERT INTO bundles (id, responsible_department, tags, source_id, profile, notification_bundle_id, notification_id, content) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(meta.responsible_department.as_deref())
            .bind(&tags)
            .bind(meta.source_id.as_deref())
            .bind(profile.as_deref())
            .bind(notification_bundle_id.as_deref())
            .bind(notification_id.as_deref())
            .bind(gzip(content.as_bytes())?)
            .execute(&mut **tx)
            .await?;
        }
        NewRecord::Binary { content_type, data } => {
            sqlx::query(
                "INSERT INTO binaries (id, responsible_department, tags, source_id, content_type, data) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(meta.responsible_department.as_deref())
            .bind(&tags)
            .bind(meta.source_id.as_deref())
            .bind(content_type)
            .bind(gzip(data)?)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

pub async fn find_bundle(pool: &Pool, id: &str) -> Result<Option<StoredBundle>> {
    let row = sqlx::query(
        "SELECT id, last_updated, responsible_department, tags, source_id, profile, content FROM bundles WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let tags: String = row.get("tags");
    let content: Vec<u8> = row.get("content");
    Ok(Some(StoredBundle {
        id: row.get("id"),
        last_updated: row.get("last_updated"),
        responsible_department: row.get("responsible_department"),
        tags: serde_json::from_str(&tags)
            .with_context(|| format!("bundle {} has malformed tags", id))?,
        source_id: row.get("source_id"),
        profile: row.get("profile"),
        content: gunzip_string(&content).with_context(|| format!("bundle {} content", id))?,
    }))
}

pub async fn find_binary(pool: &Pool, id: &str) -> Result<Option<StoredBinary>> {
    let row = sqlx::query(
        "SELECT id, last_updated, responsible_department, content_type, data FROM binaries WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let data: Vec<u8> = row.get("data");
    Ok(Some(StoredBinary {
        id: row.get("id"),
        last_updated: row.get("last_updated"),
        responsible_department: row.get("responsible_department"),
        content_type: row.get("content_type"),
        data: gunzip(&data).with_context(|| format!("binary {} data", id))?,
    }))
}

/// Delete up to `limit` expired rows of `kind` and return their ids.
#[instrument(skip_all, fields(kind = kind.as_str(), limit = limit))]
pub async fn delete_expired(
    pool: &Pool,
    kind: ResourceKind,
    periods: &PeriodsCte,
    limit: u32,
) -> Result<Vec<String>> {
    let (period, profile_join) = match kind {
        ResourceKind::Bundle => (
            "COALESCE(p2.period, p3.period, p1.period)",
            "LEFT JOIN periods p3 ON p3.rule = 'bundle-profile' AND r.profile = p3.value",
        ),
        ResourceKind::Binary => ("COALESCE(p2.period, p1.period)", ""),
    };
    let sql = format!(
        "{}{}",
        periods.sql,
        EXPIRED_DELETE
            .replace("${TABLE}", kind.table())
            .replace("${PERIOD}", period)
            .replace("${PROFILE_JOIN}", profile_join)
    );

    let mut query = sqlx::query_scalar::<_, String>(&sql);
    for bind in &periods.binds {
        query = match bind {
            PeriodBind::Text(value) => query.bind(value.clone()),
            PeriodBind::Days(days) => query.bind(*days),
        };
    }

    let mut tx = pool.begin().await?;
    let ids = query
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .with_context(|| format!("failed to delete expired {}", kind.table()))?;
    tx.commit().await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Outbox

/// Create the `NEW` outbox row for a resource. Only callable with an open transaction,
/// so the row commits or rolls back together with its resource.
#[instrument(skip_all, fields(resource_id = resource_id))]
pub async fn create_outbox_tx(tx: &mut Transaction<'_, Sqlite>, resource_id: &str) -> Result<()> {
    sqlx::query("INSERT INTO outbox (resource_id, status) VALUES (?, ?)")
        .bind(resource_id)
        .bind(SyncStatus::NEW.as_str())
        .execute(&mut **tx)
        .await?;
    debug!(resource_id, "outbox record created");
    Ok(())
}

fn outbox_from_row(row: &SqliteRow) -> Result<OutboxRecord> {
    let status: String = row.get("status");
    let status = SyncStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("outbox row has unknown status {}", status))?;
    Ok(OutboxRecord {
        resource_id: row.get("resource_id"),
        status,
        version: row.get("version"),
        remote_id: row.get("remote_id"),
        response_code: row.get("response_code"),
        error: row.get("error"),
        claim_owner: row.get("claim_owner"),
        claimed_at: row.get("claimed_at"),
        attempt: row.get("attempt"),
    })
}

pub async fn find_outbox(pool: &Pool, resource_id: &str) -> Result<Option<OutboxRecord>> {
    let row = sqlx::query(
        "SELECT resource_id, status, version, remote_id, response_code, error, claim_owner, claimed_at, attempt FROM outbox WHERE resource_id = ?",
    )
    .bind(resource_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(outbox_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn count_outbox(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Claim any one claimable `NEW` record.
#[instrument(skip_all, fields(owner = owner))]
pub async fn claim_next_new(
    pool: &Pool,
    owner: &str,
    claim_timeout_secs: u64,
) -> Result<Option<OutboxRecord>> {
    let sql = DELIVERY_CLAIM.replace("${TARGET}", "1 = 1");
    let row = sqlx::query(&sql)
        .bind(owner)
        .bind(claim_timeout_secs as i64)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(outbox_from_row).transpose()
}

/// Claim the record of one specific resource if it is still `NEW` and unclaimed.
#[instrument(skip_all, fields(resource_id = resource_id, owner = owner))]
pub async fn claim_new_by_id(
    pool: &Pool,
    resource_id: &str,
    owner: &str,
    claim_timeout_secs: u64,
) -> Result<Option<OutboxRecord>> {
    let sql = DELIVERY_CLAIM.replace("${TARGET}", "resource_id = ?");
    let row = sqlx::query(&sql)
        .bind(owner)
        .bind(resource_id)
        .bind(claim_timeout_secs as i64)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(outbox_from_row).transpose()
}

/// Outcome of one delivery attempt as persisted on the outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate<'a> {
    pub status: SyncStatus,
    pub remote_id: Option<&'a str>,
    pub response_code: Option<i64>,
    pub error: Option<&'a str>,
}

/// Persist a delivery outcome in a fresh transaction and release the claim.
///
/// Guarded by claim owner and version; returns false when the row was taken over.
#[instrument(skip_all, fields(resource_id = %claimed.resource_id, status = update.status.as_str()))]
pub async fn record_delivery(
    pool: &Pool,
    claimed: &OutboxRecord,
    owner: &str,
    update: &DeliveryUpdate<'_>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE outbox SET status = ?, remote_id = ?, response_code = ?, error = ?, version = version + 1, claim_owner = NULL, claimed_at = NULL \
         WHERE resource_id = ? AND claim_owner = ? AND version = ? AND status = 'NEW'",
    )
    .bind(update.status.as_str())
    .bind(update.remote_id)
    .bind(update.response_code)
    .bind(update.error)
    .bind(&claimed.resource_id)
    .bind(owner)
    .bind(claimed.version)
    .execute(&mut *tx)
    .await
    .context("failed to persist delivery outcome")?;
    tx.commit().await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Reconciliation

/// Claim up to `limit` records for remote deletion, stamping `owner` and raising attempts.
#[instrument(skip_all, fields(owner = owner, limit = limit))]
pub async fn claim_for_reconciliation(
    pool: &Pool,
    owner: &str,
    attempt_limit: u32,
    timeout_minutes: u64,
    limit: u32,
) -> Result<Vec<ClaimedRecord>> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query(RECONCILIATION_CLAIM)
        .bind(owner)
        .bind(i64::from(attempt_limit))
        .bind(timeout_minutes as i64)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .context("failed to claim outbox records for reconciliation")?;
    tx.commit().await?;

    Ok(rows
        .into_iter()
        .map(|row| ClaimedRecord {
            resource_id: row.get("resource_id"),
            remote_id: row.get("remote_id"),
            attempt: row.get("attempt"),
        })
        .collect())
}

/// Release every claim held by `owner`. Attempt counters and claim timestamps stay.
#[instrument(skip_all, fields(owner = owner))]
pub async fn release_claims(pool: &Pool, owner: &str) -> Result<u64> {
    let res = sqlx::query("UPDATE outbox SET claim_owner = NULL WHERE claim_owner = ?")
        .bind(owner)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Delete the reconciled records and release the claims on the rest of the batch.
#[instrument(skip_all, fields(owner = owner, reconciled = reconciled.len()))]
pub async fn finish_reconciliation(pool: &Pool, owner: &str, reconciled: &[String]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut deleted = 0;
    for resource_id in reconciled {
        deleted += sqlx::query("DELETE FROM outbox WHERE resource_id = ? AND claim_owner = ?")
            .bind(resource_id)
            .bind(owner)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    sqlx::query("UPDATE outbox SET claim_owner = NULL WHERE claim_owner = ?")
        .bind(owner)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceMeta, Tag};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn insert_bundle(pool: &Pool, id: &str) {
        let mut tx = pool.begin().await.unwrap();
        let meta = ResourceMeta {
            responsible_department: Some("1.01.0.53.".into()),
            tags: vec![Tag { system: "s".into(), code: "c".into(), display: None }],
            source_id: None,
        };
        let record = NewRecord::Bundle {
            profile: None,
            notification_bundle_id: None,
            notification_id: None,
            content: "{}".into(),
        };
        insert_resource_tx(&mut tx, id, &meta, &record).await.unwrap();
        create_outbox_tx(&mut tx, id).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_resource_and_outbox() {
        let pool = setup_pool().await;
        let mut tx = pool.begin().await.unwrap();
        let record = NewRecord::Bundle {
            profile: None,
            notification_bundle_id: None,
            notification_id: None,
            content: "{}".into(),
        };
        insert_resource_tx(&mut tx, "b-1", &ResourceMeta::default(), &record).await.unwrap();
        create_outbox_tx(&mut tx, "b-1").await.unwrap();
        tx.rollback().await.unwrap();

        assert!(find_bundle(&pool, "b-1").await.unwrap().is_none());
        assert_eq!(count_outbox(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stored_bundle_keeps_tags() {
        let pool = setup_pool().await;
        insert_bundle(&pool, "b-1").await;
        let stored = find_bundle(&pool, "b-1").await.unwrap().unwrap();
        assert_eq!(stored.tags.len(), 1);
        assert_eq!(stored.responsible_department.as_deref(), Some("1.01.0.53."));
        assert!(chrono::Utc::now() - stored.last_updated < chrono::Duration::minutes(1));
        let outbox = find_outbox(&pool, "b-1").await.unwrap().unwrap();
        assert_eq!(outbox.status, SyncStatus::NEW);
        assert_eq!(outbox.attempt, 0);
    }

    #[tokio::test]
    async fn bundles_are_indexed_by_notification_bundle_id() {
        let pool = setup_pool().await;
        let columns: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM pragma_index_info('idx_bundles_notification_bundle_id')",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(columns, vec!["notification_bundle_id"]);
    }

    #[tokio::test]
    async fn payloads_are_compressed_at_rest() {
        let pool = setup_pool().await;
        let content = r#"{"resourceType":"Bundle","entry":[{"fullUrl":"urn:uuid:1"}]}"#.repeat(10);
        let data = vec![0x25, 0x50, 0x44, 0x46, 0x2d, 0x31, 0x2e, 0x37];
        let mut tx = pool.begin().await.unwrap();
        let bundle = NewRecord::Bundle {
            profile: None,
            notification_bundle_id: None,
            notification_id: None,
            content: content.clone(),
        };
        let binary = NewRecord::Binary { content_type: "application/pdf".into(), data: data.clone() };
        insert_resource_tx(&mut tx, "b-1", &ResourceMeta::default(), &bundle).await.unwrap();
        insert_resource_tx(&mut tx, "x-1", &ResourceMeta::default(), &binary).await.unwrap();
        tx.commit().await.unwrap();

        let raw: Vec<u8> = sqlx::query_scalar("SELECT content FROM bundles WHERE id = 'b-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
        assert!(raw.len() < content.len());
        let raw: Vec<u8> = sqlx::query_scalar("SELECT data FROM binaries WHERE id = 'x-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_ne!(raw, data);

        assert_eq!(find_bundle(&pool, "b-1").await.unwrap().unwrap().content, content);
        assert_eq!(find_binary(&pool, "x-1").await.unwrap().unwrap().data, data);
    }

    #[tokio::test]
    async fn claimed_row_is_skipped_until_stale() {
        let pool = setup_pool().await;
        insert_bundle(&pool, "b-1").await;

        let first = claim_next_new(&pool, "w1", 600).await.unwrap();
        assert_eq!(first.unwrap().claim_owner.as_deref(), Some("w1"));
        assert!(claim_next_new(&pool, "w2", 600).await.unwrap().is_none());
        assert!(claim_new_by_id(&pool, "b-1", "w2", 600).await.unwrap().is_none());

        sqlx::query("UPDATE outbox SET claimed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '-20 minutes')")
            .execute(&pool)
            .await
            .unwrap();
        let stolen = claim_next_new(&pool, "w2", 600).await.unwrap().unwrap();
        assert_eq!(stolen.claim_owner.as_deref(), Some("w2"));
        assert!(stolen.claimed_at.is_some());
    }

    #[tokio::test]
    async fn record_delivery_requires_claim_and_version() {
        let pool = setup_pool().await;
        insert_bundle(&pool, "b-1").await;
        let claimed = claim_next_new(&pool, "w1", 600).await.unwrap().unwrap();

        let update = DeliveryUpdate {
            status: SyncStatus::SYNCED,
            remote_id: Some("r-1"),
            response_code: Some(201),
            error: None,
        };
        assert!(!record_delivery(&pool, &claimed, "w2", &update).await.unwrap());
        assert!(record_delivery(&pool, &claimed, "w1", &update).await.unwrap());
        assert!(!record_delivery(&pool, &claimed, "w1", &update).await.unwrap());

        let row = find_outbox(&pool, "b-1").await.unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::SYNCED);
        assert_eq!(row.remote_id.as_deref(), Some("r-1"));
        assert_eq!(row.version, 1);
        assert!(row.claim_owner.is_none());
    }

    #[test]
    fn prepare_sqlite_url_passes_memory_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }
}
