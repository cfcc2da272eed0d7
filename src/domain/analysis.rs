use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single named, scalar feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedFeature {
    pub name: String,
    pub value: f64,
}

/// Sleep-architecture features.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SleepFeatures {
    pub total_sleep_minutes: f64,
    pub sleep_efficiency: f64,
    pub sleep_latency: f64,
    pub waso_minutes: f64,
    pub awakenings_count: f64,
    pub rem_percentage: f64,
    pub deep_percentage: f64,
    pub consistency_score: f64,
}

impl SleepFeatures {
    pub fn zero() -> Self {
        Self {
            total_sleep_minutes: 0.0,
            sleep_efficiency: 0.0,
            sleep_latency: 0.0,
            waso_minutes: 0.0,
            awakenings_count: 0.0,
            rem_percentage: 0.0,
            deep_percentage: 0.0,
            consistency_score: 0.0,
        }
    }

    /// Normalization table to an `[f64; 8]` for fusion, each entry clamped to
    /// `[0, 1]` for fusion stability.
    pub fn to_fusion_vector(&self) -> [f64; 8] {
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        [
            clamp(self.total_sleep_minutes / 480.0),
            clamp(self.sleep_efficiency),
            clamp(self.sleep_latency / 60.0),
            clamp(self.waso_minutes / 120.0),
            clamp(self.awakenings_count / 10.0),
            clamp(self.rem_percentage),
            clamp(self.deep_percentage),
            clamp(self.consistency_score),
        ]
    }
}

/// Clinical read derived from the actigraphy transformer's classification
/// head, independent of the pipeline's own `PatOutput` type so this module
/// doesn't need to depend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActigraphySummary {
    pub sleep_efficiency: f64,
    pub circadian_rhythm_score: f64,
    pub depression_risk_score: f64,
    pub confidence_score: f64,
    pub clinical_insights: Vec<String>,
}

/// Written once per job on success; owned by its `ProcessingJob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub processing_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub cardio_features: [f64; 8],
    pub respiratory_features: [f64; 8],
    pub activity_features: Vec<NamedFeature>,
    pub activity_embedding: [f64; 96],
    pub sleep_features: SleepFeatures,
    pub fused_vector: Vec<f64>,
    pub actigraphy_summary: Option<ActigraphySummary>,
    pub summary_stats: serde_json::Value,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_fusion_vector_clamps_out_of_range_inputs() {
        let f = SleepFeatures {
            total_sleep_minutes: 1200.0, // > 480 => would be > 1 unclamped
            sleep_efficiency: 1.5,
            sleep_latency: -10.0,
            waso_minutes: 0.0,
            awakenings_count: 0.0,
            rem_percentage: 0.2,
            deep_percentage: 0.1,
            consistency_score: 0.9,
        };
        let v = f.to_fusion_vector();
        for x in v {
            assert!((0.0..=1.0).contains(&x));
        }
    }
}
