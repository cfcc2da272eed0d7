//! The analysis pipeline: routes a batch of metrics into modality streams,
//! extracts per-modality features, runs the actigraphy sequence through the PAT
//! transformer, and fuses everything into a single embedding.

pub mod fusion;
pub mod pat;
pub mod preprocessor;
pub mod processors;
pub mod reference_stats;
pub mod router;

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

use crate::domain::{ActigraphySummary, AnalysisResult, HealthMetric, NamedFeature};
use crate::error::PipelineResult;

use fusion::FusionModel;
use pat::PatModel;

/// Everything the pipeline needs that outlives a single analysis run: the
/// loaded model and its fusion counterpart, plus the integrity flags recorded
/// on every `AnalysisResult`.
pub struct PipelineContext<'a> {
    pub pat_model: &'a PatModel,
    pub fusion_model: &'a FusionModel,
    pub weights_verified: bool,
    pub model_integrity_verified: bool,
}

/// Builds the fusion model for the fixed modality set this crate ever produces:
/// cardio/respiratory are 8-wide statistical feature vectors, activity is the
/// PAT embedding, sleep is its own 8-wide normalized vector. Shared by the HTTP
/// binding and the worker tier so both sides agree on projection shapes.
pub fn default_fusion_model() -> FusionModel {
    let mut dims = BTreeMap::new();
    dims.insert("cardio".to_string(), 8);
    dims.insert("respiratory".to_string(), 8);
    dims.insert("activity".to_string(), pat::EMBED_DIM);
    dims.insert("sleep".to_string(), 8);
    FusionModel::new(&dims)
}

/// Runs the full pipeline for one upload's metrics and produces an
/// `AnalysisResult`. Pure modulo the model weights held in `ctx`: identical
/// `(user_id, metrics)` with the same loaded weights always yields the same
/// result.
pub fn analyze(
    processing_id: Uuid,
    user_id: Uuid,
    metrics: &[HealthMetric],
    ctx: &PipelineContext<'_>,
) -> PipelineResult<AnalysisResult> {
    let buckets = router::organize(metrics);

    let cardio_features = processors::cardio::process(&buckets.cardio);
    let respiratory_features = processors::respiratory::process(&buckets.respiratory);
    let activity_features = processors::activity::process(&buckets.activity);
    let sleep_features = processors::sleep::process(&buckets.sleep);

    let (activity_embedding, actigraphy_summary) = if buckets.activity.is_empty() {
        ([0.0_f64; pat::EMBED_DIM], None)
    } else {
        let points: Vec<(chrono::DateTime<Utc>, f64)> = buckets
            .activity
            .iter()
            .map(|m| (m.created_at, m.payload.scalar_value()))
            .collect();
        let week = preprocessor::resample_to_week(&points)?;
        let output = ctx.pat_model.forward(&week);
        let analysis = pat::postprocess(&output);
        let summary = ActigraphySummary {
            sleep_efficiency: analysis.sleep_efficiency,
            circadian_rhythm_score: analysis.circadian_rhythm_score,
            depression_risk_score: analysis.depression_risk_score,
            confidence_score: analysis.confidence_score,
            clinical_insights: analysis.clinical_insights,
        };
        (output.embedding, Some(summary))
    };

    let mut modalities: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    if !buckets.cardio.is_empty() {
        modalities.insert("cardio".to_string(), cardio_features.to_vec());
    }
    if !buckets.respiratory.is_empty() {
        modalities.insert("respiratory".to_string(), respiratory_features.to_vec());
    }
    if !buckets.activity.is_empty() {
        modalities.insert("activity".to_string(), activity_embedding.to_vec());
    }
    if !buckets.sleep.is_empty() {
        modalities.insert("sleep".to_string(), sleep_features.to_fusion_vector().to_vec());
    }

    let fused_vector = ctx.fusion_model.fuse(&modalities);

    let summary_stats = summarize(&cardio_features, &activity_features, buckets.total_len());

    let metadata = serde_json::json!({
        "weights_verified": ctx.weights_verified,
        "model_integrity_verified": ctx.model_integrity_verified,
        "pat_variant": ctx.pat_model.variant.as_str(),
        "modalities_present": modalities.keys().cloned().collect::<Vec<_>>(),
    });

    Ok(AnalysisResult {
        processing_id,
        user_id,
        timestamp: Utc::now(),
        cardio_features,
        respiratory_features,
        activity_features,
        activity_embedding,
        sleep_features,
        fused_vector,
        actigraphy_summary,
        summary_stats,
        metadata,
    })
}

/// Builds the population-comparative summary attached to every result:
/// per-modality feature values plus an NHANES z-score for the two features
/// with population reference tables (average daily steps, resting heart
/// rate proxy).
fn summarize(
    cardio_features: &[f64; 8],
    activity_features: &[NamedFeature],
    total_metrics: usize,
) -> serde_json::Value {
    let mut stats = serde_json::Map::new();
    stats.insert("total_metrics".to_string(), serde_json::json!(total_metrics));
    for f in activity_features {
        stats.insert(f.name.clone(), serde_json::json!(f.value));
        if f.name == "average_daily_steps" && f.value > 0.0 {
            let z = reference_stats::z_score(f.value, reference_stats::lookup_norm_stats(None, None, None));
            stats.insert("average_daily_steps_z_score".to_string(), serde_json::json!(z));
        }
    }
    let resting_hr = cardio_features[2];
    if resting_hr > 0.0 {
        // No dedicated resting-HR reference table; the step-count norms are
        // the only population baseline carried in this release.
        stats.insert("resting_hr".to_string(), serde_json::json!(resting_hr));
    }
    serde_json::Value::Object(stats)
}
