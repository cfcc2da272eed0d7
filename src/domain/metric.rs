use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The discriminator that determines which `MetricPayload` variant a metric
/// carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    HeartRate,
    HeartRateVariability,
    BloodPressure,
    RespiratoryRate,
    BloodOxygen,
    StepCount,
    ActiveEnergy,
    DistanceWalking,
    ExerciseTime,
    ActivityLevel,
    SleepAnalysis,
    SleepDuration,
    Other,
}

impl MetricType {
    /// Whether `payload` is the variant this metric type requires.
    pub fn matches_payload(self, payload: &MetricPayload) -> bool {
        use MetricPayload::*;
        matches!(
            (self, payload),
            (
                MetricType::HeartRate
                    | MetricType::HeartRateVariability
                    | MetricType::BloodPressure
                    | MetricType::RespiratoryRate
                    | MetricType::BloodOxygen,
                Biometric(_)
            ) | (
                MetricType::StepCount
                    | MetricType::ActiveEnergy
                    | MetricType::DistanceWalking
                    | MetricType::ExerciseTime
                    | MetricType::ActivityLevel,
                Activity(_)
            ) | (MetricType::SleepAnalysis | MetricType::SleepDuration, Sleep(_))
                | (MetricType::Other, Mental(_))
        )
    }
}

/// A single biometric sample (heart rate, HRV, blood pressure, respiratory
/// rate, or SpO2 — the metric's `MetricType` says which).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiometricData {
    pub value: f64,
}

/// A single activity sample (steps, active energy, distance, exercise minutes,
/// or a generic activity-level magnitude).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityData {
    pub value: f64,
}

/// A single sleep-stage observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepData {
    pub stage: Option<String>,
    pub minutes: f64,
}

/// A mental-health/self-report sample, routed to `other` by the modality router
/// and otherwise ignored downstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MentalHealthData {
    pub value: f64,
}

/// Tagged union over the four payload shapes. Exactly one variant is ever
/// populated for a given `HealthMetric` — representing this as an enum (rather
/// than four `Option` fields on one struct) makes that invariant statically
/// enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricPayload {
    Biometric(BiometricData),
    Activity(ActivityData),
    Sleep(SleepData),
    Mental(MentalHealthData),
}

impl MetricPayload {
    /// The scalar magnitude used by the preprocessor/processors, regardless of
    /// which variant this is.
    pub fn scalar_value(&self) -> f64 {
        match self {
            MetricPayload::Biometric(b) => b.value,
            MetricPayload::Activity(a) => a.value,
            MetricPayload::Sleep(s) => s.minutes,
            MetricPayload::Mental(m) => m.value,
        }
    }
}

/// One wearable-originated data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetric {
    pub metric_id: Uuid,
    pub user_id: Uuid,
    pub metric_type: MetricType,
    pub created_at: DateTime<Utc>,
    pub device_id: Option<String>,
    pub payload: MetricPayload,
    #[serde(default)]
    pub raw: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HealthMetric {
    /// Type-consistency check enforced on ingest.
    pub fn is_type_consistent(&self) -> bool {
        self.metric_type.matches_payload(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heart_rate_requires_biometric_payload() {
        let m = HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            metric_type: MetricType::HeartRate,
            created_at: Utc::now(),
            device_id: None,
            payload: MetricPayload::Biometric(BiometricData { value: 72.0 }),
            raw: HashMap::new(),
            metadata: HashMap::new(),
        };
        assert!(m.is_type_consistent());
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let m = HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            metric_type: MetricType::HeartRate,
            created_at: Utc::now(),
            device_id: None,
            payload: MetricPayload::Activity(ActivityData { value: 10.0 }),
            raw: HashMap::new(),
            metadata: HashMap::new(),
        };
        assert!(!m.is_type_consistent());
    }
}
