//! Fusion Layer: combines per-modality feature vectors into one fused embedding
//! via a small attention-over-modalities block.

use std::collections::BTreeMap;

use ndarray::Array2;

use super::pat::attention::{sinusoidal_positional_encoding, LinearLayer, MultiHeadAttention};

/// Common projection dimension every modality vector is mapped to before the
/// attention block.
pub const PROJECTION_DIM: usize = 64;

/// Output dimension of the fused vector.
pub const FUSED_DIM: usize = 64;

/// Fixed modality order used for both the positional encoding and any
/// deterministic iteration over a modality map.
pub const MODALITY_ORDER: [&str; 4] = ["cardio", "respiratory", "activity", "sleep"];

/// A per-modality input projection plus the shared attention combiner. Weights
/// are lazily initialized once the set of modality dimensions is known for a
/// given service lifetime — *not* loaded from pretrained weights.
pub struct FusionModel {
    projections: BTreeMap<String, LinearLayer>,
    attention: MultiHeadAttention,
    output_proj: LinearLayer,
}

impl FusionModel {
    /// Builds (with zero-initialized weights, to be replaced by a trained
    /// checkpoint in a real deployment) a fusion model for the given
    /// `{modality_name -> input_dim}` map.
    pub fn new(modality_dims: &BTreeMap<String, usize>) -> Self {
        let projections = modality_dims
            .iter()
            .map(|(name, dim)| (name.clone(), LinearLayer::zeros(*dim, PROJECTION_DIM)))
            .collect();
        Self {
            projections,
            attention: MultiHeadAttention::zeros(PROJECTION_DIM, 4, PROJECTION_DIM),
            output_proj: LinearLayer::zeros(PROJECTION_DIM, FUSED_DIM),
        }
    }

    /// Fuses `modalities` (in the fixed order `cardio, respiratory, activity,
    /// sleep`; unrecognized modality names are appended after, in map
    /// iteration order) into a single vector. An empty map returns an empty
    /// vector (no analysis result should be written for that case upstream).
    /// Exactly one modality present bypasses the fusion network and returns
    /// that modality's vector unprojected, so a single modality is never
    /// distorted by an untrained fusion projection.
    pub fn fuse(&self, modalities: &BTreeMap<String, Vec<f64>>) -> Vec<f64> {
        if modalities.is_empty() {
            return Vec::new();
        }
        if modalities.len() == 1 {
            return modalities.values().next().unwrap().clone();
        }

        let ordered: Vec<(&String, &Vec<f64>)> = ordered_modalities(modalities);

        let mut projected = Array2::zeros((ordered.len(), PROJECTION_DIM));
        for (i, (name, vector)) in ordered.iter().enumerate() {
            let Some(proj) = self.projections.get(*name) else {
                continue;
            };
            let row = Array2::from_shape_vec((1, vector.len()), (*vector).clone())
                .expect("modality vector length matches its declared input dim");
            let out = proj.forward(&row);
            projected.row_mut(i).assign(&out.row(0));
        }

        let pe = sinusoidal_positional_encoding(ordered.len(), PROJECTION_DIM);
        projected += &pe;

        let attended = self.attention.forward(&projected);
        let pooled = attended.mean_axis(ndarray::Axis(0)).unwrap();
        let pooled_row = Array2::from_shape_vec((1, PROJECTION_DIM), pooled.to_vec()).unwrap();
        self.output_proj.forward(&pooled_row).row(0).to_vec()
    }
}

/// Orders `modalities` by the fixed cardio/respiratory/activity/sleep sequence,
/// appending any other keys afterward in sorted order (stable since the map is
/// a `BTreeMap`).
fn ordered_modalities<'a>(
    modalities: &'a BTreeMap<String, Vec<f64>>,
) -> Vec<(&'a String, &'a Vec<f64>)> {
    let mut ordered = Vec::with_capacity(modalities.len());
    for &name in MODALITY_ORDER.iter() {
        if let Some((k, v)) = modalities.get_key_value(name) {
            ordered.push((k, v));
        }
    }
    for (k, v) in modalities.iter() {
        if !MODALITY_ORDER.contains(&k.as_str()) {
            ordered.push((k, v));
        }
    }
    ordered
}
