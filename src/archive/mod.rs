use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_LOCATION, LOCATION};
use reqwest::{Client, Url};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::model::{
    BatchRequest, BatchRequestEntry, BatchResponse, CreatedResource, EntryRequest,
};
use crate::config::Config;
use crate::model::SyncStatus;

pub mod model;

const FHIR_JSON: &str = "application/fhir+json";

static RESOURCE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|/)Bundle/([^/?#]+)(?:/_history/[^/?#]+)?/?(?:[?#].*)?$")
        .expect("valid resource id pattern")
});

static LEADING_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{3})\b").expect("valid status pattern"));

/// Resource as sent to the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveResource {
    pub id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub remote_id: String,
    pub status_code: u16,
}

/// Per-item result of a batch delete, matched to the request by remote id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteItem {
    pub remote_id: String,
    pub status_code: u16,
    /// Diagnostics from the entry's OperationOutcome.
    pub detail: Option<String>,
}

impl DeleteItem {
    pub fn is_failure(&self) -> bool {
        (400..600).contains(&self.status_code)
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive unavailable: {0}")]
    Unavailable(String),
    #[error("archive timed out: {0}")]
    Timeout(String),
    #[error("archive rejected request with {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("archive request failed: {0}")]
    Other(String),
}

impl ArchiveError {
    /// Outbox status a failed delivery is recorded with.
    pub fn sync_status(&self) -> SyncStatus {
        match self {
            ArchiveError::Unavailable(_) => SyncStatus::SERVER_UNAVAILABLE,
            ArchiveError::Timeout(_) => SyncStatus::SERVER_TIMEOUT,
            ArchiveError::Rejected { .. } | ArchiveError::Other(_) => SyncStatus::ERROR,
        }
    }

    pub fn response_code(&self) -> Option<u16> {
        match self {
            ArchiveError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ArchiveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ArchiveError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            ArchiveError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ArchiveError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ArchiveError::Other(err.to_string())
        }
    }
}

#[async_trait]
pub trait ArchiveClient: Send + Sync {
    async fn create(&self, resource: &ArchiveResource) -> Result<CreateOutcome, ArchiveError>;

    async fn batch_delete(&self, remote_ids: &[String]) -> Result<Vec<DeleteItem>, ArchiveError>;
}

#[derive(Clone)]
pub struct HttpArchiveClient {
    http: Client,
    base_url: Url,
    log_requests: bool,
}

impl fmt::Debug for HttpArchiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpArchiveClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpArchiveClient {
    pub fn new(base_url: &str, socket_timeout: Duration, log_requests: bool) -> Result<Self> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized).context("invalid archive URL")?;
        let http = Client::builder()
            .user_agent("notification-archive/0.1")
            .timeout(socket_timeout)
            .no_proxy()
            .build()
            .context("failed to build archive HTTP client")?;
        Ok(Self {
            http,
            base_url,
            log_requests,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            &cfg.archive.url,
            cfg.archive.socket_timeout(),
            cfg.archive.log_requests,
        )
    }

    pub fn build_create_request(&self, resource: &ArchiveResource) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("Bundle")
            .context("invalid archive base URL")?;
        self.http
            .post(endpoint)
            .header("Content-Type", FHIR_JSON)
            .header("Accept", FHIR_JSON)
            .header("Prefer", "return=minimal")
            .body(resource.content.clone())
            .build()
            .context("failed to build archive create request")
    }

    pub fn build_batch_delete_request(&self, body: &BatchRequest) -> Result<reqwest::Request> {
        self.http
            .post(self.base_url.clone())
            .header("Accept", FHIR_JSON)
            .json(body)
            .build()
            .context("failed to build archive batch request")
    }

    fn log_payload(&self, label: &str, payload: &str) {
        if self.log_requests {
            info!("{}: {}", label, payload);
        } else {
            debug!("{}: {}", label, payload);
        }
    }
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    async fn create(&self, resource: &ArchiveResource) -> Result<CreateOutcome, ArchiveError> {
        let request = self
            .build_create_request(resource)
            .map_err(|e| ArchiveError::Other(format!("{:#}", e)))?;
        debug!(url = %request.url(), bundle = %resource.id, "sending bundle to archive");
        self.log_payload("Archive request", &resource.content);

        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "archive rejected bundle: {}", body);
            return Err(ArchiveError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let headers = res.headers().clone();
        let body = res.text().await?;
        self.log_payload("Archive response", &body);
        let remote_id = remote_id_from(&headers, &body).ok_or_else(|| {
            ArchiveError::Other(format!("archive returned {} without a resource id", status))
        })?;
        Ok(CreateOutcome {
            remote_id,
            status_code: status.as_u16(),
        })
    }

    async fn batch_delete(&self, remote_ids: &[String]) -> Result<Vec<DeleteItem>, ArchiveError> {
        let body = build_batch_delete(remote_ids);
        info!(url = %self.base_url, bundles = remote_ids.len(), "purging bundles at archive");
        let request = self
            .build_batch_delete_request(&body)
            .map_err(|e| ArchiveError::Other(format!("{:#}", e)))?;
        if let Ok(payload) = serde_json::to_string(&body) {
            self.log_payload("Archive request", &payload);
        }

        let res = self.http.execute(request).await?;
        let status = res.status();
        let text = res.text().await?;
        self.log_payload("Archive response", &text);
        if !status.is_success() {
            return Err(ArchiveError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        let response: BatchResponse = serde_json::from_str(&text)
            .map_err(|e| ArchiveError::Other(format!("invalid batch response: {}", e)))?;
        match_batch_response(&body, &response)
    }
}

/// Build the batch request; ids are sorted so entries are deterministic.
pub fn build_batch_delete(remote_ids: &[String]) -> BatchRequest {
    let mut ids: Vec<&String> = remote_ids.iter().collect();
    ids.sort();
    BatchRequest {
        resource_type: "Bundle",
        typ: "batch",
        entry: ids
            .into_iter()
            .map(|id| BatchRequestEntry {
                request: EntryRequest {
                    method: "DELETE",
                    url: format!("Bundle/{}", id),
                },
            })
            .collect(),
    }
}

/// Pair each response entry with the request entry at the same position.
pub fn match_batch_response(
    request: &BatchRequest,
    response: &BatchResponse,
) -> Result<Vec<DeleteItem>, ArchiveError> {
    if request.entry.len() != response.entry.len() {
        return Err(ArchiveError::Other(format!(
            "batch response has {} entries for {} requests",
            response.entry.len(),
            request.entry.len()
        )));
    }
    request
        .entry
        .iter()
        .zip(&response.entry)
        .map(|(req, res)| {
            let remote_id = RESOURCE_ID
                .captures(&req.request.url)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| ArchiveError::Other(format!("bad request url {}", req.request.url)))?;
            let status_code = parse_status(&res.response.status).ok_or_else(|| {
                ArchiveError::Other(format!("bad entry status {:?}", res.response.status))
            })?;
            Ok(DeleteItem {
                remote_id,
                status_code,
                detail: res.response.outcome.as_ref().and_then(|o| o.diagnostics()),
            })
        })
        .collect()
}

/// Parse the leading status code of a FHIR entry status such as `"204 No Content"`.
pub fn parse_status(status: &str) -> Option<u16> {
    LEADING_STATUS
        .captures(status)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Remote id from `Location`, `Content-Location`, or the JSON body, in that order.
pub fn remote_id_from(headers: &HeaderMap, body: &str) -> Option<String> {
    [LOCATION, CONTENT_LOCATION]
        .iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            RESOURCE_ID
                .captures(value)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
        .or_else(|| {
            serde_json::from_str::<CreatedResource>(body)
                .ok()
                .and_then(|r| r.id)
                .filter(|id| !id.is_empty())
        })
}
