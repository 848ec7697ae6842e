use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, bail};

use invoice_router::channels::{DeliveryChannel, SmtpDelivery, StdoutDelivery};
use invoice_router::config::{RouterConfig, blob_root_from_env, db_path_from_env};
use invoice_router::llm::AnthropicProvider;
use invoice_router::pipeline::{
    IngestionCoordinator, Orchestrator, PipelineDeps, QueuePayload, spawn_workers,
};
use invoice_router::store::{FsBlobStore, LibSqlBackend, QueueSettings, SupplierSeed};

const USAGE: &str = "Usage: invoice-router [command]

Commands:
  serve                          Run the ingestion workers until Ctrl-C (default)
  enqueue <blob-key> [recipient] Queue a raw email stored under the blob root
  load-suppliers <file.json>     Upsert supplier directory entries
  dead-letters                   List queue entries that exhausted their attempts";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        bail!("Failed to install rustls crypto provider");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => serve().await,
        Some("enqueue") => {
            let Some(blob_key) = args.get(1) else {
                bail!("enqueue needs a blob key\n\n{USAGE}");
            };
            enqueue(blob_key, args.get(2).cloned()).await
        }
        Some("load-suppliers") => {
            let Some(file) = args.get(1) else {
                bail!("load-suppliers needs a JSON file\n\n{USAGE}");
            };
            load_suppliers(Path::new(file)).await
        }
        Some("dead-letters") => dead_letters().await,
        Some("help" | "--help" | "-h") => {
            println!("{USAGE}");
            Ok(())
        }
        Some(other) => bail!("Unknown command '{other}'\n\n{USAGE}"),
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = RouterConfig::from_env().context("Invalid configuration")?;

    eprintln!("📨 Invoice Router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Routes: {}", config.pipeline.routing.len());
    eprintln!("   Workers: {}", config.worker.concurrency);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Blobs: {}\n", config.blob_root.display());

    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?
            .with_queue_settings(QueueSettings {
                max_receives: config.pipeline.max_attempts,
                visibility_timeout: config.worker.visibility_timeout,
                release_delay: config.worker.poll_interval,
            }),
    );

    let llm = Arc::new(
        AnthropicProvider::new(config.api_key.clone(), config.model.clone())
            .context("Failed to create document service client")?,
    );

    let delivery: Arc<dyn DeliveryChannel> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpDelivery::new(smtp).context("Invalid SMTP settings")?),
        None => {
            tracing::warn!("SMTP_HOST not set, delivery units will be printed to stdout");
            Arc::new(StdoutDelivery::new())
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        config.pipeline.clone(),
        PipelineDeps {
            blobs: Arc::new(FsBlobStore::new(&config.blob_root)),
            llm,
            directory: backend.clone(),
            audit: backend.clone(),
            delivery,
        },
    ));
    let coordinator = Arc::new(IngestionCoordinator::new(backend, orchestrator));
    let (handles, shutdown) = spawn_workers(coordinator, &config.worker);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, waiting for workers to finish their current entry");
    shutdown.store(true, Ordering::Relaxed);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Worker task failed: {e}");
        }
    }
    Ok(())
}

async fn enqueue(blob_key: &str, recipient: Option<String>) -> anyhow::Result<()> {
    let blob_path = blob_root_from_env().join(blob_key);
    if !blob_path.is_file() {
        tracing::warn!(path = %blob_path.display(), "Blob does not exist yet");
    }

    let backend = open_backend().await?;
    let mut payload = QueuePayload::new(blob_key);
    payload.recipient = recipient;
    let id = backend
        .enqueue(&payload.to_json()?)
        .await
        .context("Failed to enqueue message")?;
    println!("{id}");
    Ok(())
}

async fn load_suppliers(file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let seeds: Vec<SupplierSeed> =
        serde_json::from_str(&raw).context("Expected a JSON array of supplier entries")?;

    let backend = open_backend().await?;
    let count = backend.load_suppliers(&seeds).await?;
    println!("Loaded {count} supplier(s)");
    Ok(())
}

async fn dead_letters() -> anyhow::Result<()> {
    let backend = open_backend().await?;
    let entries = backend.dead_letters().await?;
    if entries.is_empty() {
        println!("No dead-lettered entries");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  receives={}  enqueued={}  {}",
            entry.id,
            entry.receive_count,
            entry.enqueued_at.to_rfc3339(),
            entry.body
        );
    }
    Ok(())
}

async fn open_backend() -> anyhow::Result<LibSqlBackend> {
    let db_path = db_path_from_env();
    LibSqlBackend::new_local(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))
}
