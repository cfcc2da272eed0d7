use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Onboarding/consent metadata, keyed by `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub consented_at: Option<DateTime<Utc>>,
    pub onboarding_complete: bool,
    pub preferred_units: String,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            consented_at: None,
            onboarding_complete: false,
            preferred_units: "metric".to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Tracks which PAT variant/checksum a given worker process has loaded — a
/// persisted mirror of the in-process health-check state, useful for fleet-wide
/// weight-rollout auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlModelRecord {
    pub variant: String,
    pub checksum: String,
    pub weights_verified: bool,
    pub loaded_at: DateTime<Utc>,
}

/// Derived clinical-language summary keyed by `(user_id, processing_id)`,
/// generated from an `AnalysisResult` post-write as a best-effort enrichment
/// step — a failure to write one never fails the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub user_id: Uuid,
    pub processing_id: Uuid,
    pub summary: String,
    pub severity: String,
    pub created_at: DateTime<Utc>,
}
