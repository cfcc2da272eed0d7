//! Respiratory processor: `[mean_rr, std_rr, min_rr, mean_spo2, min_spo2,
//! spo2_variability, respiratory_stability, oxygenation_efficiency]`.

use crate::domain::{HealthMetric, MetricType};

use super::stats;

pub const FEATURE_LEN: usize = 8;

const SPO2_THRESHOLD: f64 = 95.0;

pub fn process(metrics: &[&HealthMetric]) -> [f64; FEATURE_LEN] {
    if metrics.is_empty() {
        return [0.0; FEATURE_LEN];
    }

    let rr: Vec<f64> = metrics
        .iter()
        .filter(|m| m.metric_type == MetricType::RespiratoryRate)
        .map(|m| m.payload.scalar_value())
        .collect();

    let spo2: Vec<f64> = metrics
        .iter()
        .filter(|m| m.metric_type == MetricType::BloodOxygen)
        .map(|m| m.payload.scalar_value())
        .collect();

    let mean_rr = stats::mean(&rr);
    let std_rr = stats::std_dev(&rr);
    let min_rr = rr.iter().cloned().fold(f64::INFINITY, f64::min);
    let min_rr = if min_rr.is_finite() { min_rr } else { 0.0 };

    let mean_spo2 = stats::mean(&spo2);
    let min_spo2 = spo2.iter().cloned().fold(f64::INFINITY, f64::min);
    let min_spo2 = if min_spo2.is_finite() { min_spo2 } else { 0.0 };
    let spo2_variability = stats::std_dev(&spo2);

    // respiratory_stability = 1 - coefficient-of-variation of RR.
    let respiratory_stability = (1.0 - stats::coefficient_of_variation(&rr)).max(0.0);

    // oxygenation_efficiency ∈ [0,1]: fraction of samples with SpO2 >= 95%.
    let oxygenation_efficiency = if spo2.is_empty() {
        0.0
    } else {
        spo2.iter().filter(|&&v| v >= SPO2_THRESHOLD).count() as f64 / spo2.len() as f64
    };

    [
        mean_rr,
        std_rr,
        min_rr,
        mean_spo2,
        min_spo2,
        spo2_variability,
        respiratory_stability,
        oxygenation_efficiency,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BiometricData, MetricPayload};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn metric(metric_type: MetricType, value: f64) -> HealthMetric {
        HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            metric_type,
            created_at: Utc::now(),
            device_id: None,
            payload: MetricPayload::Biometric(BiometricData { value }),
            raw: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn empty_bucket_is_zero_vector() {
        assert_eq!(process(&[]), [0.0; FEATURE_LEN]);
    }

    #[test]
    fn oxygenation_efficiency_counts_samples_above_threshold() {
        let metrics = vec![
            metric(MetricType::BloodOxygen, 99.0),
            metric(MetricType::BloodOxygen, 90.0),
        ];
        let refs: Vec<&HealthMetric> = metrics.iter().collect();
        let out = process(&refs);
        assert_eq!(out[7], 0.5);
    }
}
