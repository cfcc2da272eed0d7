//! Raw blob store: a content-addressed, date-partitioned object store for raw
//! uploads and analysis outputs, with storage-class lifecycle transitions and a
//! right-to-erasure delete cascade. A typed client exposes
//! `upload_raw_health_data` / `upload_analysis_results` / `download_raw_data` /
//! `list_user_files` / `delete`, backed here by the local filesystem rather
//! than an object-storage service. Object metadata (no native attribute store
//! on a plain filesystem) is kept in a `.meta.json` sidecar next to each blob.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BlobStoreConfig;
use crate::domain::{AnalysisResult, RawBlobDocument};
use crate::error::{StorageError, StorageResult};

/// Lifecycle day thresholds per data type.
const RAW_DATA_THRESHOLDS: LifecycleThresholds = LifecycleThresholds {
    infrequent_access_days: 30,
    cold_archive_days: 90,
    expire_days: 2555,
};
const ANALYSIS_RESULTS_THRESHOLDS: LifecycleThresholds = LifecycleThresholds {
    infrequent_access_days: 7,
    cold_archive_days: 30,
    expire_days: 2555,
};

struct LifecycleThresholds {
    infrequent_access_days: i64,
    cold_archive_days: i64,
    expire_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    RawHealthData,
    AnalysisResults,
}

impl DataType {
    fn thresholds(self) -> &'static LifecycleThresholds {
        match self {
            DataType::RawHealthData => &RAW_DATA_THRESHOLDS,
            DataType::AnalysisResults => &ANALYSIS_RESULTS_THRESHOLDS,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            DataType::RawHealthData => "raw_data",
            DataType::AnalysisResults => "analysis_results",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageClass {
    Standard,
    StandardIa,
    ColdArchive,
}

fn storage_class_for_age(data_type: DataType, age_days: i64) -> Option<StorageClass> {
    let t = data_type.thresholds();
    if age_days >= t.expire_days {
        None // expired: the object should be deleted, not reclassified
    } else if age_days >= t.cold_archive_days {
        Some(StorageClass::ColdArchive)
    } else if age_days >= t.infrequent_access_days {
        Some(StorageClass::StandardIa)
    } else {
        Some(StorageClass::Standard)
    }
}

/// Sidecar metadata persisted next to every object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub user_id: Uuid,
    pub processing_id: Uuid,
    pub upload_source: String,
    pub metrics_count: usize,
    pub data_type: DataType,
    pub compliance: String,
    pub storage_class: StorageClass,
    pub server_side_encryption: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ObjectListing {
    pub key: String,
    pub metadata: ObjectMetadata,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload_raw_health_data(
        &self,
        document: &RawBlobDocument,
        upload_source: &str,
    ) -> StorageResult<String>;

    /// Mirrors `upload_raw_health_data` but targets the `analysis_results`
    /// prefix with `StandardIa` from the first write, since analysis results
    /// are read far less often than raw uploads.
    async fn upload_analysis_results(&self, result: &AnalysisResult) -> StorageResult<String>;

    async fn download_raw_data(&self, key: &str) -> StorageResult<RawBlobDocument>;

    /// Prefix-scoped per user; never returns another user's objects.
    async fn list_user_files(
        &self,
        user_id: Uuid,
        data_type: Option<DataType>,
    ) -> StorageResult<Vec<ObjectListing>>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Right-to-erasure cascade: deletes every object under the user's prefixes
    /// across both data types, logging and continuing past individual failures
    /// so a later sweep can retry them. Returns the count actually deleted.
    async fn delete_user_objects(&self, user_id: Uuid) -> StorageResult<u64>;

    /// Applies storage-class transitions and expiry deletes across every
    /// object. Returns the number of objects touched (reclassified or expired).
    async fn apply_lifecycle_transitions(&self, now: DateTime<Utc>) -> StorageResult<usize>;
}

pub struct FsBlobStore {
    root: PathBuf,
    bucket: String,
}

impl FsBlobStore {
    pub fn new(config: &BlobStoreConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.root)?;
        Ok(Self {
            root: config.root.clone(),
            bucket: config.bucket.clone(),
        })
    }

    fn date_partition(ts: DateTime<Utc>) -> String {
        format!("{:04}/{:02}/{:02}", ts.year(), ts.month(), ts.day())
    }

    fn raw_key(user_id: Uuid, processing_id: Uuid, ts: DateTime<Utc>) -> String {
        format!(
            "raw_data/{}/{user_id}/{processing_id}.json",
            Self::date_partition(ts)
        )
    }

    fn analysis_key(user_id: Uuid, processing_id: Uuid, ts: DateTime<Utc>) -> String {
        format!(
            "analysis_results/{}/{user_id}/{processing_id}_results.json",
            Self::date_partition(ts)
        )
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.meta.json"))
    }

    fn write_object(&self, key: &str, bytes: &[u8], metadata: &ObjectMetadata) -> StorageResult<()> {
        let path = self.object_path(key);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, bytes)?;
        std::fs::write(self.meta_path(key), serde_json::to_vec_pretty(metadata)?)?;
        tracing::info!(
            target: "audit",
            bucket = %self.bucket,
            key,
            user_id = %metadata.user_id,
            data_type = ?metadata.data_type,
            "blob written"
        );
        Ok(())
    }

    fn read_metadata(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let bytes = std::fs::read(self.meta_path(key))
            .map_err(|_| StorageError::not_found(format!("object metadata {key}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn list_keys_under(&self, prefix: &Path) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        if !prefix.exists() {
            return Ok(keys);
        }
        let mut stack = vec![prefix.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json")
                    && !path.to_string_lossy().ends_with(".meta.json")
                {
                    let relative = path
                        .strip_prefix(&self.root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    keys.push(relative);
                }
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload_raw_health_data(
        &self,
        document: &RawBlobDocument,
        upload_source: &str,
    ) -> StorageResult<String> {
        let key = Self::raw_key(document.user_id, document.processing_id, document.server_timestamp);
        let metadata = ObjectMetadata {
            user_id: document.user_id,
            processing_id: document.processing_id,
            upload_source: upload_source.to_string(),
            metrics_count: document.metrics_count,
            data_type: DataType::RawHealthData,
            compliance: "hipaa".to_string(),
            storage_class: StorageClass::Standard,
            server_side_encryption: true,
            created_at: document.server_timestamp,
        };
        self.write_object(&key, &serde_json::to_vec(document)?, &metadata)?;
        Ok(key)
    }

    async fn upload_analysis_results(&self, result: &AnalysisResult) -> StorageResult<String> {
        let key = Self::analysis_key(result.user_id, result.processing_id, result.timestamp);
        let metadata = ObjectMetadata {
            user_id: result.user_id,
            processing_id: result.processing_id,
            upload_source: "pipeline".to_string(),
            metrics_count: 0,
            data_type: DataType::AnalysisResults,
            compliance: "hipaa".to_string(),
            storage_class: StorageClass::StandardIa,
            server_side_encryption: true,
            created_at: result.timestamp,
        };
        self.write_object(&key, &serde_json::to_vec(result)?, &metadata)?;
        Ok(key)
    }

    async fn download_raw_data(&self, key: &str) -> StorageResult<RawBlobDocument> {
        let bytes = std::fs::read(self.object_path(key))
            .map_err(|_| StorageError::not_found(format!("raw blob {key}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list_user_files(
        &self,
        user_id: Uuid,
        data_type: Option<DataType>,
    ) -> StorageResult<Vec<ObjectListing>> {
        let data_types = match data_type {
            Some(t) => vec![t],
            None => vec![DataType::RawHealthData, DataType::AnalysisResults],
        };
        let mut listings = Vec::new();
        for dt in data_types {
            for key in self.list_keys_under(&self.root.join(dt.prefix()))? {
                if let Ok(metadata) = self.read_metadata(&key) {
                    if metadata.user_id == user_id {
                        listings.push(ObjectListing { key, metadata });
                    }
                }
            }
        }
        Ok(listings)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let meta_path = self.meta_path(key);
        if meta_path.exists() {
            std::fs::remove_file(&meta_path)?;
        }
        tracing::info!(target: "audit", bucket = %self.bucket, key, "blob deleted");
        Ok(())
    }

    async fn delete_user_objects(&self, user_id: Uuid) -> StorageResult<u64> {
        let listings = self.list_user_files(user_id, None).await?;
        let mut deleted = 0u64;
        for listing in &listings {
            match self.delete(&listing.key).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(
                    target: "audit",
                    key = %listing.key,
                    error = %e,
                    "failed to delete object during user-delete cascade; left for retry"
                ),
            }
        }
        tracing::info!(
            target: "audit",
            user_id = %user_id,
            deleted,
            total = listings.len(),
            "user-delete cascade complete"
        );
        Ok(deleted)
    }

    async fn apply_lifecycle_transitions(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let mut touched = 0usize;
        for dt in [DataType::RawHealthData, DataType::AnalysisResults] {
            for key in self.list_keys_under(&self.root.join(dt.prefix()))? {
                let mut metadata = match self.read_metadata(&key) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let age_days = (now - metadata.created_at).num_days();
                match storage_class_for_age(dt, age_days) {
                    None => {
                        self.delete(&key).await?;
                        touched += 1;
                    }
                    Some(class) if class != metadata.storage_class => {
                        metadata.storage_class = class;
                        std::fs::write(self.meta_path(&key), serde_json::to_vec_pretty(&metadata)?)?;
                        touched += 1;
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FsBlobStore {
        FsBlobStore::new(&BlobStoreConfig {
            root: dir.path().to_path_buf(),
            bucket: "test-bucket".to_string(),
            region: "us-east-1".to_string(),
        })
        .unwrap()
    }

    fn sample_document(user_id: Uuid, processing_id: Uuid) -> RawBlobDocument {
        RawBlobDocument {
            user_id,
            processing_id,
            upload_source: "apple_watch".to_string(),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            sync_token: "tok".to_string(),
            metrics_count: 3,
            data_schema_version: "1.0".to_string(),
            metrics: vec![],
        }
    }

    #[tokio::test]
    async fn round_trips_a_raw_blob() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let user_id = Uuid::new_v4();
        let processing_id = Uuid::new_v4();
        let doc = sample_document(user_id, processing_id);

        let key = store.upload_raw_health_data(&doc, "apple_watch").await.unwrap();
        assert!(key.starts_with("raw_data/"));
        assert!(key.ends_with(&format!("{processing_id}.json")));

        let fetched = store.download_raw_data(&key).await.unwrap();
        assert_eq!(fetched.processing_id, processing_id);
    }

    #[tokio::test]
    async fn list_user_files_is_scoped_to_one_user() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        store
            .upload_raw_health_data(&sample_document(user_a, Uuid::new_v4()), "apple_watch")
            .await
            .unwrap();
        store
            .upload_raw_health_data(&sample_document(user_b, Uuid::new_v4()), "fitbit")
            .await
            .unwrap();

        let listing = store.list_user_files(user_a, None).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].metadata.user_id, user_a);
    }

    #[tokio::test]
    async fn lifecycle_sweep_reclassifies_aged_objects() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let user_id = Uuid::new_v4();
        let key = store
            .upload_raw_health_data(&sample_document(user_id, Uuid::new_v4()), "apple_watch")
            .await
            .unwrap();

        let future = Utc::now() + Duration::days(40);
        let touched = store.apply_lifecycle_transitions(future).await.unwrap();
        assert_eq!(touched, 1);
        let metadata = store.read_metadata(&key).unwrap();
        assert_eq!(metadata.storage_class, StorageClass::StandardIa);
    }

    #[tokio::test]
    async fn lifecycle_sweep_expires_objects_past_seven_years() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let user_id = Uuid::new_v4();
        let key = store
            .upload_raw_health_data(&sample_document(user_id, Uuid::new_v4()), "apple_watch")
            .await
            .unwrap();

        let far_future = Utc::now() + Duration::days(2600);
        store.apply_lifecycle_transitions(far_future).await.unwrap();
        assert!(!store.object_path(&key).exists());
    }

    #[tokio::test]
    async fn delete_user_objects_removes_every_owned_blob() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let user_id = Uuid::new_v4();
        store
            .upload_raw_health_data(&sample_document(user_id, Uuid::new_v4()), "apple_watch")
            .await
            .unwrap();
        store
            .upload_raw_health_data(&sample_document(user_id, Uuid::new_v4()), "apple_watch")
            .await
            .unwrap();

        let deleted = store.delete_user_objects(user_id).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.list_user_files(user_id, None).await.unwrap().is_empty());
    }
}
