//! HTTP server binary: boots the structured store, the raw blob store, the
//! in-process job queue, and the PAT model, then serves the control plane's
//! axum router.

use std::sync::Arc;

use clarity_pat_core::config::AppConfig;
use clarity_pat_core::control_plane::queue::{InProcessQueue, JobQueue};
use clarity_pat_core::domain::MlModelRecord;
use clarity_pat_core::http::{self, AppState};
use clarity_pat_core::pipeline::pat::weights;
use clarity_pat_core::storage::{BlobStore, FsBlobStore, StructuredStore};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,clarity_pat_core=debug".into()),
        )
        .init();

    let config = AppConfig::from_env();

    info!(path = %config.database.path.display(), "opening structured store");
    let store = Arc::new(StructuredStore::connect(&config.database, &config.cache).await?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.blob_store)?);
    let queue: Arc<dyn JobQueue> = Arc::new(InProcessQueue::new());

    let default_weights_path = config
        .pat
        .allowed_base_dirs
        .first()
        .cloned()
        .unwrap_or_else(|| std::path::PathBuf::from("models"))
        .join(format!("pat_{}.bin", config.pat.variant.as_str()));
    let (pat_model, weights_verified) = weights::load_model_with_status(
        config.pat.weights_path.as_deref(),
        config.pat.variant,
        &config.pat.signature_key,
        &config.pat.allowed_base_dirs,
        &default_weights_path,
    );

    let model_record = MlModelRecord {
        variant: config.pat.variant.as_str().to_string(),
        checksum: weights::checksum_for(config.pat.variant).unwrap_or("unverified").to_string(),
        weights_verified,
        loaded_at: chrono::Utc::now(),
    };
    if let Err(e) = store.put_ml_model_record(&model_record).await {
        tracing::warn!(error = %e, "failed to record loaded model metadata");
    }

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
    info!("clarity-pat-core server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
