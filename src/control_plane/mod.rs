//! Upload control plane: accepts an upload, assigns a processing identity,
//! durably persists the raw payload, tracks job state, and publishes a job
//! message for the worker tier to consume.

pub mod queue;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::ControlPlaneConfig;
use crate::domain::{
    AuditOperation, HealthMetric, JobStatus, ProcessingJob, RawBlobDocument, Upload, UserProfile,
};
use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::storage::{audit, BlobStore, StructuredStore};

use queue::{JobMessage, JobQueue};

/// Response to a successful `accept` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AcceptedUpload {
    pub processing_id: Uuid,
    pub accepted_metrics: usize,
    pub estimated_processing_time_seconds: u64,
}

pub struct UploadService {
    store: Arc<StructuredStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn JobQueue>,
    config: ControlPlaneConfig,
}

impl UploadService {
    pub fn new(
        store: Arc<StructuredStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn JobQueue>,
        config: ControlPlaneConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            queue,
            config,
        }
    }

    /// Runs the ordered 6-step accept sequence. Serial per `processing_id`: no
    /// caller observes partial intermediate state.
    pub async fn accept(
        &self,
        authenticated_user_id: Uuid,
        upload: Upload,
    ) -> ControlPlaneResult<AcceptedUpload> {
        self.validate(authenticated_user_id, &upload)?;

        // Step 0: ensure an onboarding profile exists for this user. Best
        // effort — a lookup or write failure here never blocks an upload.
        self.ensure_user_profile(upload.user_id).await;

        // Step 1: assign the processing identity.
        let processing_id = Uuid::new_v4();

        // Step 2: write the raw blob. Failure here creates no job — the
        // caller retries the whole upload with the same sync_token.
        let document = RawBlobDocument {
            user_id: upload.user_id,
            processing_id,
            upload_source: upload.upload_source.clone(),
            client_timestamp: upload.client_timestamp,
            server_timestamp: Utc::now(),
            sync_token: upload.sync_token.clone(),
            metrics_count: upload.metrics.len(),
            data_schema_version: "1.0".to_string(),
            metrics: upload.metrics.clone(),
        };
        let blob_path = self
            .blobs
            .upload_raw_health_data(&document, &upload.upload_source)
            .await
            .map_err(|e| ControlPlaneError::ServiceUnavailable(e.to_string()))?;

        // Step 3: write the job record. A failure here leaves an orphaned
        // blob behind; record it and let the retention sweep reclaim it.
        let job = ProcessingJob::new(
            processing_id,
            upload.user_id,
            upload.metrics.len() as i64,
            self.config.job_expiry_days,
        );
        if let Err(e) = self.store.put_processing_job(&job).await {
            audit::record(
                self.store.pool(),
                AuditOperation::OrphanBlob,
                "raw_data",
                &blob_path,
                Some(upload.user_id),
                serde_json::json!({"processing_id": processing_id, "reason": e.to_string()}),
            )
            .await;
            return Err(ControlPlaneError::ServiceUnavailable(e.to_string()));
        }

        // Step 4: batch-write per-metric records, chunked and retried.
        self.write_metrics_chunked(upload.user_id, &upload.upload_source, &upload.metrics)
            .await?;

        // Step 5: publish the job message. Failure leaves the job at
        // `received`; the republish sweep re-publishes it.
        let _ = self
            .queue
            .publish(JobMessage::new(processing_id, upload.user_id, blob_path))
            .await;

        Ok(AcceptedUpload {
            processing_id,
            accepted_metrics: upload.metrics.len(),
            estimated_processing_time_seconds: estimate_processing_seconds(upload.metrics.len()),
        })
    }

    async fn ensure_user_profile(&self, user_id: Uuid) {
        match self.store.get_user_profile(user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.store.put_user_profile(&UserProfile::new(user_id)).await {
                    tracing::warn!(%user_id, error = %e, "failed to create user profile");
                }
            }
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "failed to look up user profile");
            }
        }
    }

    fn validate(&self, authenticated_user_id: Uuid, upload: &Upload) -> ControlPlaneResult<()> {
        if upload.user_id != authenticated_user_id {
            return Err(ControlPlaneError::Authorization);
        }
        if upload.metrics.is_empty() {
            return Err(ControlPlaneError::validation("at least one metric is required"));
        }
        if upload.metrics.len() > self.config.max_metrics_per_upload {
            return Err(ControlPlaneError::validation(format!(
                "upload exceeds the {}-metric ceiling",
                self.config.max_metrics_per_upload
            )));
        }
        for metric in &upload.metrics {
            if !metric.is_type_consistent() {
                return Err(ControlPlaneError::validation(format!(
                    "metric {} has a payload inconsistent with its metric_type",
                    metric.metric_id
                )));
            }
        }
        Ok(())
    }

    async fn write_metrics_chunked(
        &self,
        user_id: Uuid,
        upload_source: &str,
        metrics: &[HealthMetric],
    ) -> ControlPlaneResult<()> {
        for chunk in metrics.chunks(crate::storage::BATCH_WRITE_LIMIT) {
            let mut attempt = 0;
            loop {
                match self
                    .store
                    .batch_write_health_metrics(user_id, upload_source, chunk)
                    .await
                {
                    Ok(()) => break,
                    Err(e) if attempt < 3 => {
                        attempt += 1;
                        let backoff_ms = 100u64 * (1 << (attempt - 1));
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        tracing::warn!(attempt, error = %e, "retrying health-data batch write");
                    }
                    Err(e) => return Err(ControlPlaneError::ServiceUnavailable(e.to_string())),
                }
            }
        }
        Ok(())
    }

    /// `GET /v1/health-data/processing/{id}`.
    pub async fn get_job(&self, user_id: Uuid, processing_id: Uuid) -> ControlPlaneResult<ProcessingJob> {
        let job = self.store.get_processing_job(processing_id).await?;
        // A job belonging to another user is reported identically to "not
        // found" to prevent probing.
        if job.user_id != user_id {
            return Err(ControlPlaneError::NotFound(format!("processing job {processing_id}")));
        }
        Ok(job)
    }

    /// `GET /v1/health-data/`, newest-first.
    pub async fn list_jobs(&self, user_id: Uuid, limit: i64) -> ControlPlaneResult<Vec<ProcessingJob>> {
        Ok(self.store.list_processing_jobs_for_user(user_id, limit).await?)
    }

    /// `DELETE /v1/health-data/{id}`: cancels the job and schedules erasure of
    /// its raw blob.
    pub async fn cancel(&self, user_id: Uuid, processing_id: Uuid) -> ControlPlaneResult<()> {
        let job = self.get_job(user_id, processing_id).await?;
        if job.status.is_terminal() {
            return Err(ControlPlaneError::validation(format!(
                "job {processing_id} is already in a terminal state"
            )));
        }

        self.store
            .transition_job_status(processing_id, job.status, JobStatus::Cancelled, None, None)
            .await?;

        if let Ok(listings) = self.blobs.list_user_files(user_id, None).await {
            for listing in listings.into_iter().filter(|l| l.metadata.processing_id == processing_id) {
                let _ = self.blobs.delete(&listing.key).await;
            }
        }
        Ok(())
    }

    /// Right-to-erasure cascade (Scenario E6): deletes every blob (raw and
    /// analysis-result) and every row owned by `user_id` across both stores,
    /// then emits a single cross-store `DELETE` audit event for the whole
    /// cascade. `deleted_count` is blobs + jobs + results, matching the
    /// spec's accounting; ambient rows (raw health metrics, insights, the
    /// profile row) are deleted too but not counted in that sum.
    pub async fn erase_user_data(&self, user_id: Uuid) -> ControlPlaneResult<u64> {
        let blobs_deleted = self.blobs.delete_user_objects(user_id).await?;
        let row_counts = self.store.delete_user_data(user_id).await?;
        let deleted_count = blobs_deleted + row_counts.jobs + row_counts.results;

        audit::record(
            self.store.pool(),
            AuditOperation::Delete,
            "users",
            &format!("user/{user_id}"),
            Some(user_id),
            serde_json::json!({
                "deleted_count": deleted_count,
                "blobs_deleted": blobs_deleted,
                "jobs_deleted": row_counts.jobs,
                "results_deleted": row_counts.results,
                "health_data_deleted": row_counts.health_data,
                "insights_deleted": row_counts.insights,
                "profiles_deleted": row_counts.profiles,
            }),
        )
        .await;

        Ok(deleted_count)
    }

    /// Republish sweep: `received` jobs older than 60s whose publish may have
    /// been lost.
    pub async fn republish_stale_jobs(&self) -> ControlPlaneResult<usize> {
        let now = Utc::now();
        let received = self.store.list_jobs_by_status(JobStatus::Received).await?;
        let mut republished = 0;
        for job in received.into_iter().filter(|j| j.needs_republish(now)) {
            if self
                .queue
                .publish(JobMessage::new(job.processing_id, job.user_id, String::new()))
                .await
                .is_ok()
            {
                republished += 1;
            }
        }
        Ok(republished)
    }

    /// Lease sweep: `processing` jobs whose lease has expired are rewound to
    /// `received` so a fresh worker can reclaim them.
    pub async fn reclaim_orphaned_jobs(&self) -> ControlPlaneResult<usize> {
        let now = Utc::now();
        let lease_seconds = self.config.job_lease_seconds as i64;
        let processing = self.store.list_jobs_by_status(JobStatus::Processing).await?;
        let mut reclaimed = 0;
        for job in processing.into_iter().filter(|j| j.is_orphaned(lease_seconds, now)) {
            if self
                .store
                .transition_job_status(job.processing_id, JobStatus::Processing, JobStatus::Received, None, None)
                .await
                .is_ok()
            {
                let _ = self
                    .queue
                    .publish(JobMessage::new(job.processing_id, job.user_id, String::new()))
                    .await;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

/// A rough linear estimate surfaced to the caller alongside `processing_id`;
/// not a scheduling guarantee.
fn estimate_processing_seconds(metric_count: usize) -> u64 {
    (metric_count as u64 / 200).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActivityData, MetricPayload, MetricType};
    use crate::storage::{Cache, FsBlobStore};
    use queue::InProcessQueue;
    use std::collections::HashMap;

    fn sample_metric(user_id: Uuid) -> HealthMetric {
        HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id,
            metric_type: MetricType::StepCount,
            created_at: Utc::now(),
            device_id: None,
            payload: MetricPayload::Activity(ActivityData { value: 120.0 }),
            raw: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    async fn service(dir: &tempfile::TempDir) -> UploadService {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::storage::structured_store::create_tables(&pool).await.unwrap();
        let store = Arc::new(StructuredStore::from_pool(pool, Cache::disabled()));
        let blobs = Arc::new(
            FsBlobStore::new(&crate::config::BlobStoreConfig {
                root: dir.path().to_path_buf(),
                bucket: "test".to_string(),
                region: "us-east-1".to_string(),
            })
            .unwrap(),
        );
        let queue = Arc::new(InProcessQueue::new());
        UploadService::new(store, blobs, queue, ControlPlaneConfig::default())
    }

    #[tokio::test]
    async fn accept_rejects_mismatched_authenticated_user() {
        let dir = tempfile::TempDir::new().unwrap();
        let svc = service(&dir).await;
        let other_user = Uuid::new_v4();
        let upload = Upload {
            upload_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            upload_source: "apple_watch".to_string(),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            sync_token: "s1".to_string(),
            metrics: vec![sample_metric(other_user)],
            size_bytes: 0,
        };
        let result = svc.accept(other_user, upload).await;
        assert!(matches!(result, Err(ControlPlaneError::Authorization)));
    }

    #[tokio::test]
    async fn accept_rejects_empty_metrics() {
        let dir = tempfile::TempDir::new().unwrap();
        let svc = service(&dir).await;
        let user_id = Uuid::new_v4();
        let upload = Upload {
            upload_id: Uuid::new_v4(),
            user_id,
            upload_source: "apple_watch".to_string(),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            sync_token: "s1".to_string(),
            metrics: vec![],
            size_bytes: 0,
        };
        let result = svc.accept(user_id, upload).await;
        assert!(matches!(result, Err(ControlPlaneError::Validation(_))));
    }

    #[tokio::test]
    async fn accept_writes_blob_job_and_metrics_and_publishes() {
        let dir = tempfile::TempDir::new().unwrap();
        let svc = service(&dir).await;
        let user_id = Uuid::new_v4();
        let upload = Upload {
            upload_id: Uuid::new_v4(),
            user_id,
            upload_source: "apple_watch".to_string(),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            sync_token: "s1".to_string(),
            metrics: vec![sample_metric(user_id), sample_metric(user_id)],
            size_bytes: 0,
        };
        let accepted = svc.accept(user_id, upload).await.unwrap();
        assert_eq!(accepted.accepted_metrics, 2);

        let job = svc.get_job(user_id, accepted.processing_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Received);

        let message = svc.queue.consume().await.unwrap();
        assert_eq!(message.processing_id, accepted.processing_id);
    }

    #[tokio::test]
    async fn accept_creates_a_user_profile_on_first_upload() {
        let dir = tempfile::TempDir::new().unwrap();
        let svc = service(&dir).await;
        let user_id = Uuid::new_v4();
        let upload = Upload {
            upload_id: Uuid::new_v4(),
            user_id,
            upload_source: "apple_watch".to_string(),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            sync_token: "s1".to_string(),
            metrics: vec![sample_metric(user_id)],
            size_bytes: 0,
        };
        svc.accept(user_id, upload).await.unwrap();
        let profile = svc.store.get_user_profile(user_id).await.unwrap();
        assert!(profile.is_some());
    }

    #[tokio::test]
    async fn get_job_for_wrong_user_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let svc = service(&dir).await;
        let user_id = Uuid::new_v4();
        let upload = Upload {
            upload_id: Uuid::new_v4(),
            user_id,
            upload_source: "apple_watch".to_string(),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            sync_token: "s1".to_string(),
            metrics: vec![sample_metric(user_id)],
            size_bytes: 0,
        };
        let accepted = svc.accept(user_id, upload).await.unwrap();
        let result = svc.get_job(Uuid::new_v4(), accepted.processing_id).await;
        assert!(matches!(result, Err(ControlPlaneError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_transitions_job_and_removes_blob() {
        let dir = tempfile::TempDir::new().unwrap();
        let svc = service(&dir).await;
        let user_id = Uuid::new_v4();
        let upload = Upload {
            upload_id: Uuid::new_v4(),
            user_id,
            upload_source: "apple_watch".to_string(),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            sync_token: "s1".to_string(),
            metrics: vec![sample_metric(user_id)],
            size_bytes: 0,
        };
        let accepted = svc.accept(user_id, upload).await.unwrap();
        svc.cancel(user_id, accepted.processing_id).await.unwrap();

        let job = svc.get_job(user_id, accepted.processing_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        let remaining = svc.blobs.list_user_files(user_id, None).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn erase_user_data_counts_blobs_jobs_and_results_and_audits_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let svc = service(&dir).await;
        let user_id = Uuid::new_v4();
        for _ in 0..2 {
            let upload = Upload {
                upload_id: Uuid::new_v4(),
                user_id,
                upload_source: "apple_watch".to_string(),
                client_timestamp: Utc::now(),
                server_timestamp: Utc::now(),
                sync_token: "s1".to_string(),
                metrics: vec![sample_metric(user_id)],
                size_bytes: 0,
            };
            svc.accept(user_id, upload).await.unwrap();
        }

        let deleted_count = svc.erase_user_data(user_id).await.unwrap();
        // 2 raw blobs + 2 jobs + 0 analysis results (no worker ran).
        assert_eq!(deleted_count, 4);

        let remaining_blobs = svc.blobs.list_user_files(user_id, None).await.unwrap();
        assert!(remaining_blobs.is_empty());
        let remaining_jobs = svc.store.list_processing_jobs_for_user(user_id, 10).await.unwrap();
        assert!(remaining_jobs.is_empty());

        let audits = svc
            .store
            .query_audit_events_for_item("users", &format!("user/{user_id}"))
            .await
            .unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].metadata["deleted_count"], serde_json::json!(4));
    }
}
