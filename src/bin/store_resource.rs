use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use notification_archive::archive::{ArchiveClient, HttpArchiveClient};
use notification_archive::config;
use notification_archive::db;
use notification_archive::model::{BinaryDocument, BundleDocument, Resource, ResourceKind, ResourceMeta};
use notification_archive::outbox::DeliveryDispatcher;
use notification_archive::writer::ResourceWriter;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Store one resource document and deliver it to the archive"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Resource kind: bundle or binary
    #[arg(long, value_parser = parse_kind)]
    kind: ResourceKind,

    /// Owning health department
    #[arg(long)]
    department: Option<String>,

    /// Bundle profile URI
    #[arg(long)]
    profile: Option<String>,

    /// Content type of a binary document
    #[arg(long, default_value = "application/octet-stream")]
    content_type: String,

    /// Bundle JSON or binary payload
    file: PathBuf,
}

fn parse_kind(s: &str) -> Result<ResourceKind, String> {
    ResourceKind::parse_kind(s).ok_or_else(|| format!("unknown resource kind: {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let raw = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let meta = ResourceMeta {
        responsible_department: args.department,
        tags: Vec::new(),
        source_id: None,
    };
    let resource = match args.kind {
        ResourceKind::Bundle => {
            let content: serde_json::Value =
                serde_json::from_slice(&raw).context("bundle file is not valid JSON")?;
            Resource::Bundle {
                meta,
                doc: BundleDocument {
                    profile: args.profile,
                    notification_bundle_id: content.get("id").and_then(|v| v.as_str()).map(String::from),
                    notification_id: None,
                    content,
                },
            }
        }
        ResourceKind::Binary => Resource::Binary {
            meta,
            doc: BinaryDocument {
                content_type: args.content_type,
                data: raw,
            },
        },
    };

    let dispatcher = if cfg.archive.enabled && resource.kind().requires_archival() {
        let client: Arc<dyn ArchiveClient> = Arc::new(HttpArchiveClient::from_config(&cfg)?);
        Some(DeliveryDispatcher::start(pool.clone(), client, &cfg.delivery, &cfg.worker_id()))
    } else {
        None
    };

    let writer = if cfg.archive.enabled {
        ResourceWriter::new(pool.clone(), dispatcher.as_ref().map(|d| d.handle()))
    } else {
        ResourceWriter::local_only(pool.clone())
    };
    let refs = writer.store(std::slice::from_ref(&resource)).await?;
    let Some(reference) = refs.first() else {
        bail!("store returned no reference");
    };
    println!("{}", reference);

    drop(writer);
    if let Some(dispatcher) = dispatcher {
        dispatcher.shutdown().await;
    }
    if let Some(id) = reference.strip_prefix("Bundle/") {
        if let Some(record) = db::find_outbox(&pool, id).await? {
            info!(status = record.status.as_str(), remote_id = ?record.remote_id, "delivery state");
        }
    }
    Ok(())
}
