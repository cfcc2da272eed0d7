//! Modality Router: partitions a batch of metrics into modality streams by
//! metric-type tag. Pure function, no side effects.

use crate::domain::{HealthMetric, MetricType};

/// The organized output of `organize`. Iteration order over buckets (when
/// needed by a caller) is `cardio, respiratory, activity, sleep, other`,
/// matching the fixed modality order used by fusion.
#[derive(Debug, Default)]
pub struct ModalityBuckets<'a> {
    pub cardio: Vec<&'a HealthMetric>,
    pub respiratory: Vec<&'a HealthMetric>,
    pub activity: Vec<&'a HealthMetric>,
    pub sleep: Vec<&'a HealthMetric>,
    pub other: Vec<&'a HealthMetric>,
}

impl<'a> ModalityBuckets<'a> {
    /// Total metrics across all buckets — used by router partition tests.
    pub fn total_len(&self) -> usize {
        self.cardio.len()
            + self.respiratory.len()
            + self.activity.len()
            + self.sleep.len()
            + self.other.len()
    }
}

/// Routing table.
fn bucket_for(metric_type: MetricType) -> Bucket {
    match metric_type {
        MetricType::HeartRate | MetricType::HeartRateVariability | MetricType::BloodPressure => {
            Bucket::Cardio
        }
        MetricType::RespiratoryRate | MetricType::BloodOxygen => Bucket::Respiratory,
        MetricType::StepCount
        | MetricType::ActiveEnergy
        | MetricType::DistanceWalking
        | MetricType::ExerciseTime
        | MetricType::ActivityLevel => Bucket::Activity,
        MetricType::SleepAnalysis | MetricType::SleepDuration => Bucket::Sleep,
        MetricType::Other => Bucket::Other,
    }
}

enum Bucket {
    Cardio,
    Respiratory,
    Activity,
    Sleep,
    Other,
}

/// Partition `metrics` into modality buckets. Every metric lands in exactly one
/// bucket, including `other` — no metric is dropped.
pub fn organize(metrics: &[HealthMetric]) -> ModalityBuckets<'_> {
    let mut buckets = ModalityBuckets::default();
    for m in metrics {
        match bucket_for(m.metric_type) {
            Bucket::Cardio => buckets.cardio.push(m),
            Bucket::Respiratory => buckets.respiratory.push(m),
            Bucket::Activity => buckets.activity.push(m),
            Bucket::Sleep => buckets.sleep.push(m),
            Bucket::Other => buckets.other.push(m),
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MetricPayload;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn metric(metric_type: MetricType, payload: MetricPayload) -> HealthMetric {
        HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            metric_type,
            created_at: Utc::now(),
            device_id: None,
            payload,
            raw: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn partitions_without_overlap_or_loss() {
        use crate::domain::{ActivityData, BiometricData, MentalHealthData, SleepData};

        let metrics = vec![
            metric(
                MetricType::HeartRate,
                MetricPayload::Biometric(BiometricData { value: 70.0 }),
            ),
            metric(
                MetricType::BloodOxygen,
                MetricPayload::Biometric(BiometricData { value: 98.0 }),
            ),
            metric(
                MetricType::StepCount,
                MetricPayload::Activity(ActivityData { value: 500.0 }),
            ),
            metric(
                MetricType::SleepAnalysis,
                MetricPayload::Sleep(SleepData {
                    stage: Some("deep".into()),
                    minutes: 45.0,
                }),
            ),
            metric(
                MetricType::Other,
                MetricPayload::Mental(MentalHealthData { value: 3.0 }),
            ),
        ];

        let buckets = organize(&metrics);
        assert_eq!(buckets.cardio.len(), 1);
        assert_eq!(buckets.respiratory.len(), 1);
        assert_eq!(buckets.activity.len(), 1);
        assert_eq!(buckets.sleep.len(), 1);
        assert_eq!(buckets.other.len(), 1);
        assert_eq!(buckets.total_len(), metrics.len());
    }

    #[test]
    fn empty_input_yields_empty_buckets() {
        let buckets = organize(&[]);
        assert_eq!(buckets.total_len(), 0);
    }
}
