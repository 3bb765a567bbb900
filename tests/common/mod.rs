#![allow(dead_code)]

use async_trait::async_trait;
use notification_archive::archive::{
    ArchiveClient, ArchiveError, ArchiveResource, CreateOutcome, DeleteItem,
};
use notification_archive::config::{self, Config};
use notification_archive::db::{self, Pool};
use notification_archive::model::{BinaryDocument, BundleDocument, Resource, ResourceMeta};
use notification_archive::purge::{AuditSink, BatchAuditEvent};
use notification_archive::writer::ResourceWriter;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn example_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

pub fn bundle(department: Option<&str>, profile: Option<&str>) -> Resource {
    Resource::Bundle {
        meta: ResourceMeta {
            responsible_department: department.map(str::to_string),
            ..Default::default()
        },
        doc: BundleDocument {
            profile: profile.map(str::to_string),
            notification_bundle_id: None,
            notification_id: None,
            content: json!({"resourceType": "Bundle", "type": "document"}),
        },
    }
}

pub fn binary(department: Option<&str>) -> Resource {
    Resource::Binary {
        meta: ResourceMeta {
            responsible_department: department.map(str::to_string),
            ..Default::default()
        },
        doc: BinaryDocument {
            content_type: "application/pdf".into(),
            data: vec![0x25, 0x50, 0x44, 0x46],
        },
    }
}

/// Store resources without a delivery pool and return their bare ids.
pub async fn store(pool: &Pool, resources: &[Resource]) -> Vec<String> {
    let writer = ResourceWriter::new(pool.clone(), None);
    writer
        .store(resources)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.split_once('/').unwrap().1.to_string())
        .collect()
}

pub async fn age(pool: &Pool, table: &str, id: &str, days: u32) {
    sqlx::query(&format!(
        "UPDATE {} SET last_updated = strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '-{} days') WHERE id = ?",
        table, days
    ))
    .bind(id)
    .execute(pool)
    .await
    .unwrap();
}

/// Insert an outbox row directly. `claimed_ago` is a SQLite modifier such as `-10 minutes`.
pub async fn seed_outbox(
    pool: &Pool,
    resource_id: &str,
    remote_id: Option<&str>,
    attempt: i64,
    claim_owner: Option<&str>,
    claimed_ago: Option<&str>,
) {
    sqlx::query(
        "INSERT INTO outbox (resource_id, status, remote_id, attempt, claim_owner, claimed_at) \
         VALUES (?, 'SYNCED', ?, ?, ?, CASE WHEN ? IS NULL THEN NULL ELSE strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?) END)",
    )
    .bind(resource_id)
    .bind(remote_id)
    .bind(attempt)
    .bind(claim_owner)
    .bind(claimed_ago)
    .bind(claimed_ago)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn count(pool: &Pool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn outbox_attempt(pool: &Pool, resource_id: &str) -> (i64, Option<String>) {
    let record = db::find_outbox(pool, resource_id).await.unwrap().unwrap();
    (record.attempt, record.claim_owner)
}

#[derive(Clone, Default)]
pub struct RecordingArchive {
    create_responses: Arc<Mutex<VecDeque<Result<CreateOutcome, ArchiveError>>>>,
    delete_errors: Arc<Mutex<VecDeque<ArchiveError>>>,
    failing: Arc<Mutex<HashMap<String, u16>>>,
    created: Arc<Mutex<Vec<String>>>,
    deleted: Arc<Mutex<Vec<Vec<String>>>>,
}

impl RecordingArchive {
    pub fn with_create_responses(responses: Vec<Result<CreateOutcome, ArchiveError>>) -> Self {
        Self {
            create_responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    /// Answer deletes of `remote_id` with `status` from now on.
    pub async fn fail_delete(&self, remote_id: &str, status: u16) {
        self.failing.lock().await.insert(remote_id.to_string(), status);
    }

    pub async fn fail_next_batch(&self, err: ArchiveError) {
        self.delete_errors.lock().await.push_back(err);
    }

    pub async fn created(&self) -> Vec<String> {
        self.created.lock().await.clone()
    }

    pub async fn deleted(&self) -> Vec<Vec<String>> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl ArchiveClient for RecordingArchive {
    async fn create(&self, resource: &ArchiveResource) -> Result<CreateOutcome, ArchiveError> {
        self.created.lock().await.push(resource.id.clone());
        let scripted = self.create_responses.lock().await.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(CreateOutcome {
                remote_id: format!("remote-{}", resource.id),
                status_code: 201,
            })
        })
    }

    async fn batch_delete(&self, remote_ids: &[String]) -> Result<Vec<DeleteItem>, ArchiveError> {
        self.deleted.lock().await.push(remote_ids.to_vec());
        if let Some(err) = self.delete_errors.lock().await.pop_front() {
            return Err(err);
        }
        let failing = self.failing.lock().await;
        Ok(remote_ids
            .iter()
            .map(|id| DeleteItem {
                remote_id: id.clone(),
                status_code: failing.get(id).copied().unwrap_or(204),
                detail: failing.get(id).map(|status| format!("scripted failure {}", status)),
            })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    events: std::sync::Mutex<Vec<BatchAuditEvent>>,
    exhausted: std::sync::Mutex<Vec<(String, u32, Vec<String>)>>,
    empty_runs: std::sync::Mutex<Vec<String>>,
}

impl RecordingAudit {
    pub fn events_for(&self, resource: &str) -> Vec<BatchAuditEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.resource == resource)
            .cloned()
            .collect()
    }

    pub fn deleted_ids(&self, resource: &str) -> Vec<String> {
        self.events_for(resource)
            .into_iter()
            .flat_map(|e| e.succeeded)
            .collect()
    }

    pub fn exhausted(&self) -> Vec<(String, u32, Vec<String>)> {
        self.exhausted.lock().unwrap().clone()
    }

    /// Resources whose run found nothing to purge, in order.
    pub fn empty_runs(&self) -> Vec<String> {
        self.empty_runs.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAudit {
    fn batch_completed(&self, event: &BatchAuditEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn attempts_exhausted(&self, resource: &str, limit: u32, resource_ids: &[String]) {
        self.exhausted
            .lock()
            .unwrap()
            .push((resource.to_string(), limit, resource_ids.to_vec()));
    }

    fn nothing_to_purge(&self, resource: &str) {
        self.empty_runs.lock().unwrap().push(resource.to_string());
    }
}
