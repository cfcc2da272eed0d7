//! End-to-end exercise of the worker tier's queue-consumption loop: publish a
//! job message, let `Worker::run_forever` pick it up off a real
//! `InProcessQueue`, and observe the job reach a terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use clarity_pat_core::config::{BlobStoreConfig, ControlPlaneConfig};
use clarity_pat_core::control_plane::queue::{InProcessQueue, JobMessage, JobQueue};
use clarity_pat_core::domain::{
    ActivityData, HealthMetric, JobStatus, MetricPayload, MetricType, ProcessingJob, RawBlobDocument,
};
use clarity_pat_core::pipeline::fusion::FusionModel;
use clarity_pat_core::pipeline::pat::{PatModel, PatVariant};
use clarity_pat_core::storage::{BlobStore, Cache, FsBlobStore, StructuredStore};
use clarity_pat_core::worker::Worker;

fn sample_metric(user_id: Uuid) -> HealthMetric {
    HealthMetric {
        metric_id: Uuid::new_v4(),
        user_id,
        metric_type: MetricType::StepCount,
        created_at: Utc::now(),
        device_id: None,
        payload: MetricPayload::Activity(ActivityData { value: 80.0 }),
        raw: Default::default(),
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn run_forever_drains_a_published_job_to_completion() {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    clarity_pat_core::storage::structured_store::create_tables(&pool)
        .await
        .unwrap();
    let store = Arc::new(StructuredStore::from_pool(pool, Cache::disabled()));
    let blobs: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::new(&BlobStoreConfig {
            root: dir.path().to_path_buf(),
            bucket: "test".to_string(),
            region: "us-east-1".to_string(),
        })
        .unwrap(),
    );
    let queue: Arc<dyn JobQueue> = Arc::new(InProcessQueue::new());

    let user_id = Uuid::new_v4();
    let processing_id = Uuid::new_v4();
    let metrics = vec![sample_metric(user_id)];
    let document = RawBlobDocument {
        user_id,
        processing_id,
        upload_source: "apple_watch".to_string(),
        client_timestamp: Utc::now(),
        server_timestamp: Utc::now(),
        sync_token: "s1".to_string(),
        metrics_count: metrics.len(),
        data_schema_version: "1.0".to_string(),
        metrics,
    };
    let blob_path = blobs.upload_raw_health_data(&document, "apple_watch").await.unwrap();
    store
        .put_processing_job(&ProcessingJob::new(processing_id, user_id, 1, 30))
        .await
        .unwrap();

    let worker = Worker::new(
        store.clone(),
        blobs,
        queue.clone(),
        Arc::new(PatModel::random_init(PatVariant::Small)),
        Arc::new(FusionModel::new(&BTreeMap::new())),
        false,
        false,
        ControlPlaneConfig::default(),
    );

    let loop_handle = tokio::spawn(async move { worker.run_forever().await });

    queue
        .publish(JobMessage::new(processing_id, user_id, blob_path))
        .await
        .unwrap();

    let mut job = store.get_processing_job(processing_id).await.unwrap();
    for _ in 0..50 {
        if job.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        job = store.get_processing_job(processing_id).await.unwrap();
    }

    assert_eq!(job.status, JobStatus::Completed);
    loop_handle.abort();
}
