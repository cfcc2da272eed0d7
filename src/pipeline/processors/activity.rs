//! Activity-basic processor: a named-feature list rather than a fixed
//! positional vector, since the set of named features is the client-facing
//! shape.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::domain::{HealthMetric, MetricType, NamedFeature};

use super::stats;

pub fn process(metrics: &[&HealthMetric]) -> Vec<NamedFeature> {
    if metrics.is_empty() {
        return vec![
            NamedFeature { name: "total_steps".to_string(), value: 0.0 },
            NamedFeature { name: "average_daily_steps".to_string(), value: 0.0 },
            NamedFeature { name: "total_distance".to_string(), value: 0.0 },
            NamedFeature { name: "total_active_energy".to_string(), value: 0.0 },
            NamedFeature { name: "total_exercise_minutes".to_string(), value: 0.0 },
            NamedFeature { name: "activity_consistency_score".to_string(), value: 0.0 },
            NamedFeature { name: "latest_vo2_max".to_string(), value: 0.0 },
        ];
    }

    let steps: Vec<&HealthMetric> = metrics
        .iter()
        .copied()
        .filter(|m| m.metric_type == MetricType::StepCount)
        .collect();
    let distance: Vec<f64> = metrics
        .iter()
        .filter(|m| m.metric_type == MetricType::DistanceWalking)
        .map(|m| m.payload.scalar_value())
        .collect();
    let energy: Vec<f64> = metrics
        .iter()
        .filter(|m| m.metric_type == MetricType::ActiveEnergy)
        .map(|m| m.payload.scalar_value())
        .collect();
    let exercise: Vec<f64> = metrics
        .iter()
        .filter(|m| m.metric_type == MetricType::ExerciseTime)
        .map(|m| m.payload.scalar_value())
        .collect();

    let total_steps: f64 = steps.iter().map(|m| m.payload.scalar_value()).sum();
    let daily_totals = per_day_totals(&steps);
    let days = daily_totals.len().max(1);
    let average_daily_steps = total_steps / days as f64;

    let daily_values: Vec<f64> = daily_totals.values().copied().collect();
    let activity_consistency_score = 1.0 - stats::gini(&daily_values);

    let latest_vo2_max = latest_vo2_max(metrics);

    vec![
        NamedFeature {
            name: "total_steps".to_string(),
            value: total_steps,
        },
        NamedFeature {
            name: "average_daily_steps".to_string(),
            value: average_daily_steps,
        },
        NamedFeature {
            name: "total_distance".to_string(),
            value: distance.iter().sum(),
        },
        NamedFeature {
            name: "total_active_energy".to_string(),
            value: energy.iter().sum(),
        },
        NamedFeature {
            name: "total_exercise_minutes".to_string(),
            value: exercise.iter().sum(),
        },
        NamedFeature {
            name: "activity_consistency_score".to_string(),
            value: activity_consistency_score,
        },
        NamedFeature {
            name: "latest_vo2_max".to_string(),
            value: latest_vo2_max,
        },
    ]
}

fn per_day_totals(steps: &[&HealthMetric]) -> HashMap<NaiveDate, f64> {
    let mut totals: HashMap<NaiveDate, f64> = HashMap::new();
    for m in steps {
        let day = m.created_at.date_naive();
        *totals.entry(day).or_insert(0.0) += m.payload.scalar_value();
    }
    totals
}

fn latest_vo2_max(metrics: &[&HealthMetric]) -> f64 {
    metrics
        .iter()
        .filter_map(|m| {
            m.raw
                .get("vo2_max")
                .and_then(|v| v.as_f64())
                .map(|vo2| (m.created_at, vo2))
        })
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, vo2)| vo2)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActivityData, MetricPayload};
    use chrono::Utc;
    use std::collections::HashMap as Map;
    use uuid::Uuid;

    fn step_metric(value: f64) -> HealthMetric {
        HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            metric_type: MetricType::StepCount,
            created_at: Utc::now(),
            device_id: None,
            payload: MetricPayload::Activity(ActivityData { value }),
            raw: Map::new(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn empty_bucket_yields_zero_features() {
        let out = process(&[]);
        assert!(out.iter().all(|f| f.value == 0.0));
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn totals_steps_across_metrics() {
        let metrics = vec![step_metric(100.0), step_metric(200.0)];
        let refs: Vec<&HealthMetric> = metrics.iter().collect();
        let out = process(&refs);
        let total = out.iter().find(|f| f.name == "total_steps").unwrap();
        assert_eq!(total.value, 300.0);
    }
}
