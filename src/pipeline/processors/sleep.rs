//! Sleep processor: `SleepFeatures { total_sleep_minutes, sleep_efficiency,
//! sleep_latency, waso_minutes, awakenings_count, rem_percentage,
//! deep_percentage, consistency_score }`.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::domain::{HealthMetric, MetricPayload, MetricType, SleepFeatures};

use super::stats;

/// A normalized sleep stage, derived from the free-text `stage` field on
/// `SleepData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Awake,
    Rem,
    Deep,
    Light,
}

fn classify_stage(stage: Option<&str>) -> Stage {
    match stage.map(|s| s.to_ascii_lowercase()) {
        Some(s) if s.contains("awake") || s.contains("wake") => Stage::Awake,
        Some(s) if s.contains("rem") => Stage::Rem,
        Some(s) if s.contains("deep") => Stage::Deep,
        _ => Stage::Light,
    }
}

pub fn process(metrics: &[&HealthMetric]) -> SleepFeatures {
    let mut segments: Vec<(chrono::DateTime<chrono::Utc>, Stage, f64)> = metrics
        .iter()
        .filter(|m| {
            matches!(
                m.metric_type,
                MetricType::SleepAnalysis | MetricType::SleepDuration
            )
        })
        .filter_map(|m| match &m.payload {
            MetricPayload::Sleep(s) => {
                Some((m.created_at, classify_stage(s.stage.as_deref()), s.minutes))
            }
            _ => None,
        })
        .collect();

    if segments.is_empty() {
        return SleepFeatures::zero();
    }
    segments.sort_by_key(|(ts, _, _)| *ts);

    let total_in_bed: f64 = segments.iter().map(|(_, _, m)| m).sum();
    let total_sleep_minutes: f64 = segments
        .iter()
        .filter(|(_, stage, _)| *stage != Stage::Awake)
        .map(|(_, _, m)| m)
        .sum();

    let sleep_efficiency = if total_in_bed > 0.0 {
        (total_sleep_minutes / total_in_bed).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // Leading awake run = sleep latency. Trailing awake run is the
    // final-wake segment and is excluded from WASO.
    let mut sleep_latency = 0.0;
    let mut onset_idx = 0;
    for (i, (_, stage, minutes)) in segments.iter().enumerate() {
        if *stage == Stage::Awake {
            sleep_latency += minutes;
            onset_idx = i + 1;
        } else {
            break;
        }
    }

    let mut trailing_awake_start = segments.len();
    for i in (0..segments.len()).rev() {
        if segments[i].1 == Stage::Awake {
            trailing_awake_start = i;
        } else {
            break;
        }
    }

    let interior = if onset_idx < trailing_awake_start {
        &segments[onset_idx..trailing_awake_start]
    } else {
        &segments[0..0]
    };

    let waso_minutes: f64 = interior
        .iter()
        .filter(|(_, stage, _)| *stage == Stage::Awake)
        .map(|(_, _, m)| m)
        .sum();

    let mut awakenings_count = 0.0;
    let mut prev_awake = false;
    for (_, stage, _) in interior {
        let is_awake = *stage == Stage::Awake;
        if is_awake && !prev_awake {
            awakenings_count += 1.0;
        }
        prev_awake = is_awake;
    }

    let rem_minutes: f64 = segments
        .iter()
        .filter(|(_, stage, _)| *stage == Stage::Rem)
        .map(|(_, _, m)| m)
        .sum();
    let deep_minutes: f64 = segments
        .iter()
        .filter(|(_, stage, _)| *stage == Stage::Deep)
        .map(|(_, _, m)| m)
        .sum();

    let rem_percentage = if total_sleep_minutes > 0.0 {
        (rem_minutes / total_sleep_minutes).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let deep_percentage = if total_sleep_minutes > 0.0 {
        (deep_minutes / total_sleep_minutes).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let consistency_score = consistency_across_nights(&segments);

    SleepFeatures {
        total_sleep_minutes,
        sleep_efficiency,
        sleep_latency,
        waso_minutes,
        awakenings_count,
        rem_percentage,
        deep_percentage,
        consistency_score,
    }
}

/// `1 - coefficient-of-variation` of nightly total-sleep-minutes, a simple
/// night-to-night regularity proxy. A single observed night is treated as
/// perfectly consistent (no variation to measure).
fn consistency_across_nights(segments: &[(chrono::DateTime<chrono::Utc>, Stage, f64)]) -> f64 {
    let mut per_night: HashMap<NaiveDate, f64> = HashMap::new();
    for (ts, stage, minutes) in segments {
        if *stage != Stage::Awake {
            *per_night.entry(ts.date_naive()).or_insert(0.0) += minutes;
        }
    }
    if per_night.len() < 2 {
        return 1.0;
    }
    let totals: Vec<f64> = per_night.values().copied().collect();
    (1.0 - stats::coefficient_of_variation(&totals)).clamp(0.0, 1.0)
}
