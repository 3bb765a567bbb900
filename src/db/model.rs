//! Row models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in `outbox` and `purge`.

use crate::model::{SyncStatus, Tag};
use chrono::{DateTime, Utc};

/// Full outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub resource_id: String,
    pub status: SyncStatus,
    pub version: i64,
    pub remote_id: Option<String>,
    pub response_code: Option<i64>,
    pub error: Option<String>,
    pub claim_owner: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempt: i64,
}

/// Outbox slice returned by the reconciliation claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRecord {
    pub resource_id: String,
    pub remote_id: String,
    /// Attempt counter after the claim incremented it.
    pub attempt: i64,
}

#[derive(Debug, Clone)]
pub struct StoredBundle {
    pub id: String,
    pub last_updated: DateTime<Utc>,
    pub responsible_department: Option<String>,
    pub tags: Vec<Tag>,
    pub source_id: Option<String>,
    pub profile: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct StoredBinary {
    pub id: String,
    pub last_updated: DateTime<Utc>,
    pub responsible_department: Option<String>,
    pub content_type: String,
    pub data: Vec<u8>,
}
