//! Cardio processor: `[mean_hr, std_hr, resting_hr, max_hr, mean_hrv,
//! hrv_rmssd, hr_recovery, circadian_phase]`.

use chrono::{Duration, Timelike};

use crate::domain::{HealthMetric, MetricType};

use super::stats;

pub const FEATURE_LEN: usize = 8;

/// Extracts the cardio feature vector. An empty bucket returns an all-zeros
/// vector rather than erroring.
pub fn process(metrics: &[&HealthMetric]) -> [f64; FEATURE_LEN] {
    if metrics.is_empty() {
        return [0.0; FEATURE_LEN];
    }

    let mut hr: Vec<(chrono::DateTime<chrono::Utc>, f64)> = metrics
        .iter()
        .filter(|m| m.metric_type == MetricType::HeartRate)
        .map(|m| (m.created_at, m.payload.scalar_value()))
        .collect();
    hr.sort_by_key(|(ts, _)| *ts);

    let hrv: Vec<f64> = metrics
        .iter()
        .filter(|m| m.metric_type == MetricType::HeartRateVariability)
        .map(|m| m.payload.scalar_value())
        .collect();

    let hr_values: Vec<f64> = hr.iter().map(|(_, v)| *v).collect();

    let mean_hr = stats::mean(&hr_values);
    let std_hr = stats::std_dev(&hr_values);
    let max_hr = hr_values.iter().cloned().fold(0.0_f64, f64::max);

    let resting_hr = resting_hr_last_24h(&hr);
    let mean_hrv = stats::mean(&hrv);
    let hrv_rmssd = stats::rmssd(&hrv);
    let hr_recovery = average_recovery(&hr);
    let circadian = circadian_phase(&hr);

    [
        mean_hr,
        std_hr,
        resting_hr,
        max_hr,
        mean_hrv,
        hrv_rmssd,
        hr_recovery,
        circadian,
    ]
}

/// 5th percentile of HR restricted to the 24h window ending at the latest
/// sample.
fn resting_hr_last_24h(hr: &[(chrono::DateTime<chrono::Utc>, f64)]) -> f64 {
    if hr.is_empty() {
        return 0.0;
    }
    let latest = hr.last().unwrap().0;
    let window_start = latest - Duration::hours(24);
    let windowed: Vec<f64> = hr
        .iter()
        .filter(|(ts, _)| *ts >= window_start)
        .map(|(_, v)| *v)
        .collect();
    stats::percentile(&windowed, 5.0)
}

/// Mean, across detected local-maxima peaks, of `peak_hr - hr_60s_after`.
fn average_recovery(hr: &[(chrono::DateTime<chrono::Utc>, f64)]) -> f64 {
    if hr.len() < 3 {
        return 0.0;
    }
    let mut recoveries = Vec::new();
    for i in 1..hr.len() - 1 {
        let (t, v) = hr[i];
        if v > hr[i - 1].1 && v >= hr[i + 1].1 {
            // local maximum; find the post-peak sample nearest 60s later
            let target = t + Duration::seconds(60);
            if let Some((_, post_v)) = hr[i + 1..]
                .iter()
                .min_by_key(|(ts, _)| (*ts - target).num_seconds().abs())
            {
                recoveries.push(v - post_v);
            }
        }
    }
    stats::mean(&recoveries)
}

fn circadian_phase(hr: &[(chrono::DateTime<chrono::Utc>, f64)]) -> f64 {
    let samples: Vec<(f64, f64)> = hr
        .iter()
        .map(|(ts, v)| (ts.hour() as f64 + ts.minute() as f64 / 60.0, *v))
        .collect();
    stats::circadian_phase(&samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BiometricData, MetricPayload};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn hr_metric(minutes_ago: i64, value: f64) -> HealthMetric {
        HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            metric_type: MetricType::HeartRate,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
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
    fn basic_stats_are_within_input_range() {
        let metrics = vec![hr_metric(60, 60.0), hr_metric(30, 70.0), hr_metric(0, 80.0)];
        let refs: Vec<&HealthMetric> = metrics.iter().collect();
        let out = process(&refs);
        assert!(out[0] >= 60.0 && out[0] <= 80.0); // mean_hr
        assert_eq!(out[3], 80.0); // max_hr
    }
}
