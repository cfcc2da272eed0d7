//! Operational CLI: migrations, the worker tier, the HTTP server, the retention
//! sweep, and a health probe, all against the same env-driven configuration the
//! server binary uses.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use clarity_pat_core::config::AppConfig;
use clarity_pat_core::control_plane::queue::{InProcessQueue, JobQueue};
use clarity_pat_core::domain::MlModelRecord;
use clarity_pat_core::http::{self, AppState};
use clarity_pat_core::pipeline::pat::{weights, PatVariant};
use clarity_pat_core::storage::{structured_store, BlobStore, FsBlobStore, StructuredStore};
use clarity_pat_core::worker::Worker;

#[derive(Parser)]
#[command(name = "clarity-pat-cli", about = "Operational commands for clarity-pat-core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Commands {
    /// Run pending structured-store migrations.
    Migrate,
    /// Start the worker tier against the configured queue.
    Worker,
    /// Start the HTTP control plane.
    Serve,
    /// Run the raw-blob lifecycle/retention sweep once.
    BackfillRetention,
    /// Print structured-store and blob-store health.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,clarity_pat_core=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Migrate => run_migrate(&config).await?,
        Commands::Worker => run_worker(&config).await?,
        Commands::Serve => run_serve(&config).await?,
        Commands::BackfillRetention => run_backfill_retention(&config).await?,
        Commands::Health => run_health(&config).await?,
    }

    Ok(())
}

async fn run_migrate(config: &AppConfig) -> anyhow::Result<()> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    structured_store::run_migrations(&pool).await?;
    structured_store::create_tables(&pool).await?;
    println!("{} structured-store schema is up to date", "✓".green());
    Ok(())
}

fn default_weights_path(config: &AppConfig) -> std::path::PathBuf {
    config
        .pat
        .allowed_base_dirs
        .first()
        .cloned()
        .unwrap_or_else(|| std::path::PathBuf::from("models"))
        .join(format!("pat_{}.bin", config.pat.variant.as_str()))
}

/// Persists a record of which PAT variant/checksum this process loaded, for
/// fleet-wide weight-rollout auditing. Best-effort: a failure here is logged,
/// not propagated, since it never blocks serving or processing.
async fn record_loaded_model(store: &StructuredStore, variant: PatVariant, weights_verified: bool) {
    let record = MlModelRecord {
        variant: variant.as_str().to_string(),
        checksum: weights::checksum_for(variant).unwrap_or("unverified").to_string(),
        weights_verified,
        loaded_at: chrono::Utc::now(),
    };
    if let Err(e) = store.put_ml_model_record(&record).await {
        tracing::warn!(error = %e, "failed to record loaded model metadata");
    }
}

async fn run_worker(config: &AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(StructuredStore::connect(&config.database, &config.cache).await?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.blob_store)?);
    let queue: Arc<dyn JobQueue> = Arc::new(InProcessQueue::new());

    let default_path = default_weights_path(config);
    let (pat_model, weights_verified) = weights::load_model_with_status(
        config.pat.weights_path.as_deref(),
        config.pat.variant,
        &config.pat.signature_key,
        &config.pat.allowed_base_dirs,
        &default_path,
    );
    record_loaded_model(&store, config.pat.variant, weights_verified).await;

    println!(
        "{} starting worker tier (concurrency={}, weights_verified={weights_verified})",
        "→".cyan(),
        config.control_plane.max_worker_concurrency
    );

    let worker = Worker::new(
        store,
        blobs,
        queue,
        Arc::new(pat_model),
        Arc::new(clarity_pat_core::pipeline::default_fusion_model()),
        weights_verified,
        weights_verified,
        config.control_plane.clone(),
    );
    worker.run_forever().await;
    Ok(())
}

async fn run_serve(config: &AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(StructuredStore::connect(&config.database, &config.cache).await?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.blob_store)?);
    let queue: Arc<dyn JobQueue> = Arc::new(InProcessQueue::new());

    let default_path = default_weights_path(config);
    let (pat_model, weights_verified) = weights::load_model_with_status(
        config.pat.weights_path.as_deref(),
        config.pat.variant,
        &config.pat.signature_key,
        &config.pat.allowed_base_dirs,
        &default_path,
    );
    record_loaded_model(&store, config.pat.variant, weights_verified).await;

    let state = AppState {
        store,
        blobs,
        queue,
        control_plane_config: config.control_plane.clone(),
        pat_model: Arc::new(pat_model),
        weights_verified,
        model_integrity_verified: weights_verified,
    };

    let app = http::router(state);
    let addr = config.http.bind_addr();
    println!("{} serving on http://{}", "→".cyan(), addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_backfill_retention(config: &AppConfig) -> anyhow::Result<()> {
    let blobs = FsBlobStore::new(&config.blob_store)?;
    let touched = blobs.apply_lifecycle_transitions(chrono::Utc::now()).await?;
    println!("{} retention sweep touched {touched} object(s)", "✓".green());
    Ok(())
}

async fn run_health(config: &AppConfig) -> anyhow::Result<()> {
    let store = StructuredStore::connect(&config.database, &config.cache).await?;
    match store.health_check().await {
        Ok(health) => println!(
            "{} structured store: connected={} latency_ms={} processing_jobs={}",
            "✓".green(),
            health.connected,
            health.latency_ms,
            health.processing_job_count
        ),
        Err(e) => println!("{} structured store: {e}", "✗".red()),
    }
    println!("{} blob store root: {}", "✓".green(), config.blob_store.root.display());
    Ok(())
}
