//! Worker tier: consumes job messages published by the control plane, runs the
//! analysis pipeline, and persists the result. A `tokio::sync::Semaphore` sized
//! to the configured concurrency bounds in-flight jobs; one `tokio::spawn` per
//! job, results collected with `futures::future::join_all` and
//! `filter_map(Result::ok)` so a panicking task degrades that one job instead
//! of the batch.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::ControlPlaneConfig;
use crate::control_plane::queue::{JobMessage, JobQueue};
use crate::domain::{AuditOperation, Insight, JobStatus};
use crate::error::PipelineError;
use crate::pipeline::{self, PipelineContext};
use crate::pipeline::fusion::FusionModel;
use crate::pipeline::pat::PatModel;
use crate::storage::{audit, BlobStore, DataType, StructuredStore};

/// Everything a worker needs to turn a `JobMessage` into an `AnalysisResult`.
pub struct Worker {
    store: Arc<StructuredStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn JobQueue>,
    pat_model: Arc<PatModel>,
    fusion_model: Arc<FusionModel>,
    weights_verified: bool,
    model_integrity_verified: bool,
    config: ControlPlaneConfig,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        store: Arc<StructuredStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn JobQueue>,
        pat_model: Arc<PatModel>,
        fusion_model: Arc<FusionModel>,
        weights_verified: bool,
        model_integrity_verified: bool,
        config: ControlPlaneConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_worker_concurrency));
        Self {
            store,
            blobs,
            queue,
            pat_model,
            fusion_model,
            weights_verified,
            model_integrity_verified,
            config,
            semaphore,
        }
    }

    /// Consumes the queue until every publisher handle is dropped, spawning one
    /// task per job behind the shared semaphore. Returns once the queue is
    /// closed and every in-flight job has finished.
    pub async fn run_forever(&self) {
        let mut handles = Vec::new();
        while let Some(message) = self.queue.consume().await {
            let permit_source = self.semaphore.clone();
            let worker = self.clone_handles();
            handles.push(tokio::spawn(async move {
                let _permit = permit_source.acquire_owned().await.unwrap();
                worker.process_job(message).await
            }));
        }
        join_all(handles).await.into_iter().filter_map(|r| r.ok()).count();
    }

    /// Cheap `Arc`-clone of everything `process_job` needs, so each spawned
    /// task owns its handles instead of borrowing `self`.
    fn clone_handles(&self) -> Worker {
        Worker {
            store: self.store.clone(),
            blobs: self.blobs.clone(),
            queue: self.queue.clone(),
            pat_model: self.pat_model.clone(),
            fusion_model: self.fusion_model.clone(),
            weights_verified: self.weights_verified,
            model_integrity_verified: self.model_integrity_verified,
            config: self.config.clone(),
            semaphore: self.semaphore.clone(),
        }
    }

    /// Processes a single job message end to end. Never propagates an error: a
    /// failure this deep is recorded on the job and in the audit log, not
    /// returned to the caller, since nothing is waiting synchronously on a
    /// queued job.
    async fn process_job(&self, message: JobMessage) {
        let processing_id = message.processing_id;
        let user_id = message.user_id;

        let job = match self.store.get_processing_job(processing_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(%processing_id, error = %e, "dropping job message for unknown job");
                return;
            }
        };

        if job.status.is_terminal() || job.status == JobStatus::Processing {
            audit::record(
                self.store.pool(),
                AuditOperation::PipelineReplaySuppressed,
                "processing_jobs",
                &processing_id.to_string(),
                Some(user_id),
                serde_json::json!({"status": job.status.as_str()}),
            )
            .await;
            return;
        }

        if self
            .store
            .transition_job_status(processing_id, JobStatus::Received, JobStatus::Processing, None, None)
            .await
            .is_err()
        {
            // Lost the race to another worker consuming a redelivered message.
            return;
        }
        audit::record(
            self.store.pool(),
            AuditOperation::PipelineStarted,
            "processing_jobs",
            &processing_id.to_string(),
            Some(user_id),
            serde_json::json!({}),
        )
        .await;

        let raw_blob_path = match self.resolve_raw_blob_path(&message).await {
            Some(path) => path,
            None => {
                self.fail_job(processing_id, user_id, "raw blob not found").await;
                return;
            }
        };

        let document = match self.blobs.download_raw_data(&raw_blob_path).await {
            Ok(document) => document,
            Err(e) => {
                self.fail_job(processing_id, user_id, &e.to_string()).await;
                return;
            }
        };

        let outcome = self.run_pipeline_with_retry(processing_id, user_id, document.metrics.clone()).await;

        match outcome {
            Ok(result) => match self.store.put_analysis_result(&result).await {
                Ok(()) => {
                    let _ = self
                        .store
                        .transition_job_status(
                            processing_id,
                            JobStatus::Processing,
                            JobStatus::Completed,
                            Some(document.metrics_count as i64),
                            None,
                        )
                        .await;
                    audit::record(
                        self.store.pool(),
                        AuditOperation::PipelineCompleted,
                        "processing_jobs",
                        &processing_id.to_string(),
                        Some(user_id),
                        serde_json::json!({}),
                    )
                    .await;
                    // Best-effort: the structured store write is the record
                    // of truth, the blob copy is a convenience export.
                    let _ = self.blobs.upload_analysis_results(&result).await;

                    if let Some(summary) = &result.actigraphy_summary {
                        let severity = if summary.depression_risk_score >= 0.7 {
                            "elevated"
                        } else if summary.depression_risk_score >= 0.4 {
                            "moderate"
                        } else {
                            "low"
                        };
                        let insight = Insight {
                            user_id,
                            processing_id,
                            summary: summary.clinical_insights.join(" "),
                            severity: severity.to_string(),
                            created_at: chrono::Utc::now(),
                        };
                        if let Err(e) = self.store.put_insight(&insight).await {
                            tracing::warn!(%processing_id, error = %e, "failed to persist insight");
                        }
                    }
                }
                Err(e) => self.fail_job(processing_id, user_id, &e.to_string()).await,
            },
            Err(e) => self.fail_job(processing_id, user_id, e.reason_code()).await,
        }
    }

    /// Runs the pipeline, retrying an `InferenceFailure` up to 2 additional
    /// times with backoff (per the StorageFailure-adjacent retry policy for
    /// runtime model failures); `DataValidation`/`Timeout`/`Storage` errors are
    /// never retried here and propagate on the first attempt.
    async fn run_pipeline_with_retry(
        &self,
        processing_id: Uuid,
        user_id: Uuid,
        metrics: Vec<crate::domain::HealthMetric>,
    ) -> Result<crate::domain::AnalysisResult, PipelineError> {
        let mut attempt = 0;
        loop {
            match self.run_pipeline(processing_id, user_id, metrics.clone()).await {
                Ok(result) => return Ok(result),
                Err(PipelineError::Inference(msg)) if attempt < 2 => {
                    attempt += 1;
                    let backoff_ms = 100u64 * (1 << (attempt - 1));
                    tracing::warn!(%processing_id, attempt, error = %msg, "retrying PAT inference after failure");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the pipeline on a blocking thread under the configured wall-clock
    /// budget.
    async fn run_pipeline(
        &self,
        processing_id: Uuid,
        user_id: Uuid,
        metrics: Vec<crate::domain::HealthMetric>,
    ) -> Result<crate::domain::AnalysisResult, PipelineError> {
        let pat_model = self.pat_model.clone();
        let fusion_model = self.fusion_model.clone();
        let weights_verified = self.weights_verified;
        let model_integrity_verified = self.model_integrity_verified;

        let handle = tokio::task::spawn_blocking(move || {
            let ctx = PipelineContext {
                pat_model: &pat_model,
                fusion_model: &fusion_model,
                weights_verified,
                model_integrity_verified,
            };
            pipeline::analyze(processing_id, user_id, &metrics, &ctx)
        });

        let budget = Duration::from_secs(self.config.job_timeout_seconds);
        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(PipelineError::Inference(join_err.to_string())),
            Err(_elapsed) => Err(PipelineError::Timeout),
        }
    }

    /// Finds the raw blob this job's document lives at. The accept path hands
    /// the key straight through on the queue message; the republish and lease
    /// sweeps don't have it to hand over, so those fall back to a scoped
    /// listing.
    async fn resolve_raw_blob_path(&self, message: &JobMessage) -> Option<String> {
        if !message.raw_blob_path.is_empty() {
            return Some(message.raw_blob_path.clone());
        }
        let listings = self
            .blobs
            .list_user_files(message.user_id, Some(DataType::RawHealthData))
            .await
            .ok()?;
        listings
            .into_iter()
            .find(|l| l.metadata.processing_id == message.processing_id)
            .map(|l| l.key)
    }

    async fn fail_job(&self, processing_id: Uuid, user_id: Uuid, reason: &str) {
        let _ = self
            .store
            .transition_job_status(
                processing_id,
                JobStatus::Processing,
                JobStatus::Failed,
                None,
                Some(reason.to_string()),
            )
            .await;
        audit::record(
            self.store.pool(),
            AuditOperation::PipelineFailed,
            "processing_jobs",
            &processing_id.to_string(),
            Some(user_id),
            serde_json::json!({"reason": reason}),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlobStoreConfig, ControlPlaneConfig};
    use crate::control_plane::queue::InProcessQueue;
    use crate::domain::{ActivityData, HealthMetric, MetricPayload, MetricType, RawBlobDocument};
    use crate::pipeline::pat::PatVariant;
    use crate::storage::Cache;
    use chrono::Utc;
    use std::collections::{BTreeMap, HashMap};

    fn sample_metric(user_id: Uuid) -> HealthMetric {
        HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id,
            metric_type: MetricType::StepCount,
            created_at: Utc::now(),
            device_id: None,
            payload: MetricPayload::Activity(ActivityData { value: 80.0 }),
            raw: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    async fn store() -> Arc<StructuredStore> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::storage::structured_store::create_tables(&pool).await.unwrap();
        Arc::new(StructuredStore::from_pool(pool, Cache::disabled()))
    }

    fn worker(
        store: Arc<StructuredStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Worker {
        let pat_model = Arc::new(PatModel::random_init(PatVariant::Small));
        let fusion_model = Arc::new(FusionModel::new(&BTreeMap::new()));
        Worker::new(
            store,
            blobs,
            queue,
            pat_model,
            fusion_model,
            false,
            false,
            ControlPlaneConfig::default(),
        )
    }

    #[tokio::test]
    async fn processes_a_received_job_to_completion() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store().await;
        let blobs: Arc<dyn BlobStore> = Arc::new(
            crate::storage::FsBlobStore::new(&BlobStoreConfig {
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

        let job = crate::domain::ProcessingJob::new(processing_id, user_id, 1, 30);
        store.put_processing_job(&job).await.unwrap();

        let w = worker(store.clone(), blobs, queue.clone());
        w.process_job(JobMessage::new(processing_id, user_id, blob_path)).await;

        let job = store.get_processing_job(processing_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let insights = store.list_insights(user_id).await.unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].processing_id, processing_id);
    }

    #[tokio::test]
    async fn a_terminal_job_is_not_reprocessed() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store().await;
        let blobs: Arc<dyn BlobStore> = Arc::new(
            crate::storage::FsBlobStore::new(&BlobStoreConfig {
                root: dir.path().to_path_buf(),
                bucket: "test".to_string(),
                region: "us-east-1".to_string(),
            })
            .unwrap(),
        );
        let queue: Arc<dyn JobQueue> = Arc::new(InProcessQueue::new());

        let user_id = Uuid::new_v4();
        let processing_id = Uuid::new_v4();
        let mut job = crate::domain::ProcessingJob::new(processing_id, user_id, 1, 30);
        job.status = JobStatus::Completed;
        store.put_processing_job(&job).await.unwrap();

        let w = worker(store.clone(), blobs, queue);
        // An empty raw_blob_path with nothing in the blob store would fail
        // download; a terminal job must short-circuit before that point.
        w.process_job(JobMessage::new(processing_id, user_id, String::new())).await;

        let job = store.get_processing_job(processing_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn a_job_with_no_resolvable_blob_fails_cleanly() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store().await;
        let blobs: Arc<dyn BlobStore> = Arc::new(
            crate::storage::FsBlobStore::new(&BlobStoreConfig {
                root: dir.path().to_path_buf(),
                bucket: "test".to_string(),
                region: "us-east-1".to_string(),
            })
            .unwrap(),
        );
        let queue: Arc<dyn JobQueue> = Arc::new(InProcessQueue::new());

        let user_id = Uuid::new_v4();
        let processing_id = Uuid::new_v4();
        let job = crate::domain::ProcessingJob::new(processing_id, user_id, 1, 30);
        store.put_processing_job(&job).await.unwrap();

        let w = worker(store.clone(), blobs, queue);
        w.process_job(JobMessage::new(processing_id, user_id, String::new())).await;

        let job = store.get_processing_job(processing_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("raw blob not found"));
    }
}
