use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metric::HealthMetric;

/// An accepted upload. Immutable once accepted; `upload_id` doubles as the
/// `processing_id` threaded through the rest of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub upload_id: Uuid,
    pub user_id: Uuid,
    pub upload_source: String,
    pub client_timestamp: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub server_timestamp: DateTime<Utc>,
    pub sync_token: String,
    pub metrics: Vec<HealthMetric>,
    #[serde(default)]
    pub size_bytes: usize,
}

/// Raw-blob JSON schema: `{user_id, processing_id, upload_source,
/// client_timestamp, server_timestamp, sync_token, metrics_count,
/// data_schema_version, metrics}`. Distinct from `Upload` because the wire
/// schema freezes field order/naming independent of the in-memory struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlobDocument {
    pub user_id: Uuid,
    pub processing_id: Uuid,
    pub upload_source: String,
    pub client_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    pub sync_token: String,
    pub metrics_count: usize,
    pub data_schema_version: String,
    pub metrics: Vec<HealthMetric>,
}

impl From<&Upload> for RawBlobDocument {
    fn from(u: &Upload) -> Self {
        Self {
            user_id: u.user_id,
            processing_id: u.upload_id,
            upload_source: u.upload_source.clone(),
            client_timestamp: u.client_timestamp,
            server_timestamp: u.server_timestamp,
            sync_token: u.sync_token.clone(),
            metrics_count: u.metrics.len(),
            data_schema_version: "1.0".to_string(),
            metrics: u.metrics.clone(),
        }
    }
}

impl RawBlobDocument {
    /// Reconstructs the logical `Upload` from a raw-blob document: equal under
    /// the declared schema modulo float/decimal re-encoding and the
    /// `size_bytes` field, which is not persisted in the wire schema and is
    /// recomputed by the caller when needed.
    pub fn into_upload(self) -> Upload {
        Upload {
            upload_id: self.processing_id,
            user_id: self.user_id,
            upload_source: self.upload_source,
            client_timestamp: self.client_timestamp,
            server_timestamp: self.server_timestamp,
            sync_token: self.sync_token,
            metrics: self.metrics,
            size_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BiometricData, MetricPayload, MetricType};
    use std::collections::HashMap;

    fn sample_upload() -> Upload {
        Upload {
            upload_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            upload_source: "apple_watch".to_string(),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
            sync_token: "s1".to_string(),
            metrics: vec![HealthMetric {
                metric_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                metric_type: MetricType::HeartRate,
                created_at: Utc::now(),
                device_id: None,
                payload: MetricPayload::Biometric(BiometricData { value: 70.0 }),
                raw: HashMap::new(),
                metadata: HashMap::new(),
            }],
            size_bytes: 128,
        }
    }

    #[test]
    fn round_trips_through_raw_blob_document() {
        let upload = sample_upload();
        let doc = RawBlobDocument::from(&upload);
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: RawBlobDocument = serde_json::from_str(&json).unwrap();
        let restored = parsed.into_upload();
        assert_eq!(restored.upload_id, upload.upload_id);
        assert_eq!(restored.metrics.len(), upload.metrics.len());
        assert_eq!(restored.sync_token, upload.sync_token);
    }
}
