//! Configuration loader and validator for the archive sync and purge jobs.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_WORKER_ID: &str = "notification-archive";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub archive: Archive,
    pub delivery: Delivery,
    pub purger: Purger,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Identity used for batch labels and claim owners. Falls back to `HOSTNAME`.
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// Remote archive server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Archive {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    pub socket_timeout_ms: u64,
    #[serde(default)]
    pub log_requests: bool,
}

/// Delivery worker pool and retry sweeper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub workers: usize,
    pub queue_capacity: usize,
    pub sweeper_interval_secs: u64,
    pub claim_timeout_secs: u64,
}

/// Purge job settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Purger {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub batches: Batches,
    pub attempts: Attempts,
    pub retention: Retention,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batches {
    pub size: u32,
    /// Maximum batches per run; 0 means unlimited.
    #[serde(default)]
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attempts {
    pub limit: u32,
    pub timeout_minutes: u64,
}

/// Retention periods in days.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retention {
    #[serde(default)]
    pub default_days: Option<u32>,
    #[serde(default)]
    pub departments: BTreeMap<String, u32>,
    #[serde(default)]
    pub profiles: BTreeMap<String, u32>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Worker identity: configured value, then `HOSTNAME`, then a fixed default.
    pub fn worker_id(&self) -> String {
        self.app
            .worker_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_WORKER_ID.to_string())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/archive.db", self.app.data_dir))
    }
}

impl Archive {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

impl Delivery {
    pub fn sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper_interval_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.archive.enabled && cfg.archive.url.trim().is_empty() {
        return Err(ConfigError::Invalid("archive.url must be non-empty"));
    }
    if cfg.archive.socket_timeout_ms == 0 {
        return Err(ConfigError::Invalid("archive.socket_timeout_ms must be > 0"));
    }

    if cfg.delivery.workers == 0 {
        return Err(ConfigError::Invalid("delivery.workers must be > 0"));
    }
    if cfg.delivery.queue_capacity == 0 {
        return Err(ConfigError::Invalid("delivery.queue_capacity must be > 0"));
    }
    if cfg.delivery.sweeper_interval_secs == 0 {
        return Err(ConfigError::Invalid("delivery.sweeper_interval_secs must be > 0"));
    }
    // Delivery claims must outlive the slowest live create.
    if cfg.delivery.claim_timeout_secs == 0 {
        return Err(ConfigError::Invalid("delivery.claim_timeout_secs must be > 0"));
    }
    if cfg.delivery.claim_timeout_secs.saturating_mul(1000) <= cfg.archive.socket_timeout_ms {
        return Err(ConfigError::Invalid(
            "delivery.claim_timeout_secs must exceed archive.socket_timeout_ms",
        ));
    }

    if cfg.purger.batches.size == 0 {
        return Err(ConfigError::Invalid("purger.batches.size must be > 0"));
    }
    // batches.limit is u32; 0 disables the cap
    if cfg.purger.attempts.limit == 0 {
        return Err(ConfigError::Invalid("purger.attempts.limit must be > 0"));
    }
    if cfg.purger.attempts.timeout_minutes == 0 {
        return Err(ConfigError::Invalid("purger.attempts.timeout_minutes must be > 0"));
    }
    if cfg.purger.retention.default_days.is_none() {
        return Err(ConfigError::Invalid("purger.retention.default_days must be set"));
    }

    Ok(())
}

/// Returns the example YAML shipped with the binary.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  worker_id: "archive-worker-0"

archive:
  enabled: true
  url: "http://localhost:8080/fhir"
  socket_timeout_ms: 10000
  log_requests: false

delivery:
  workers: 4
  queue_capacity: 100
  sweeper_interval_secs: 300
  claim_timeout_secs: 600

purger:
  enabled: true
  batches:
    size: 1000
    limit: 0
  attempts:
    limit: 3
    timeout_minutes: 60
  retention:
    default_days: 30
    departments:
      "1.01.0.53.": 60
      "1.02.0.74.": 50
    profiles:
      "https://demis.rki.de/fhir/StructureDefinition/NotificationBundleSequence": 40
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.purger.retention.default_days, Some(30));
        assert_eq!(cfg.purger.retention.departments.len(), 2);
    }

    #[test]
    fn missing_default_retention_is_fatal() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.purger.retention.default_days = None;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("default_days")), _ => panic!("wrong error") }
    }

    #[test]
    fn default_retention_absent_from_yaml() {
        let yaml = example().replace("    default_days: 30\n", "");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(cfg.purger.retention.default_days.is_none());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_batch_and_attempt_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.purger.batches.size = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("batches.size")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.purger.attempts.limit = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.purger.batches.limit = 0;
        validate(&cfg).unwrap();
    }

    #[test]
    fn archive_url_only_required_when_enabled() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.archive.url = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        cfg.archive.enabled = false;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_delivery_pool() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.delivery.workers = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.delivery.queue_capacity = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_claim_timeouts_are_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.delivery.claim_timeout_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("claim_timeout_secs")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.purger.attempts.timeout_minutes = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("timeout_minutes")), _ => panic!("wrong error") }
    }

    #[test]
    fn delivery_claim_must_outlive_socket_timeout() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.archive.socket_timeout_ms = 10_000;
        cfg.delivery.claim_timeout_secs = 10;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("socket_timeout_ms")), _ => panic!("wrong error") }

        cfg.delivery.claim_timeout_secs = 11;
        validate(&cfg).unwrap();
    }

    #[test]
    fn configured_worker_id_wins() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        assert_eq!(cfg.worker_id(), "archive-worker-0");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.delivery.workers, 4);
        assert_eq!(cfg.purger.attempts.limit, 3);
    }
}
