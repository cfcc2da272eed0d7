//! Foreign-weight loader: translates the pretrained PAT weight file's
//! tensor-naming convention into this crate's per-head weight layout, gated
//! behind SHA-256 + HMAC-SHA-256 integrity verification and path sanitization
//! against an allow-list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use ndarray::Array2;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};

use super::{Architecture, EncoderLayer, LayerNorm, LinearLayer, PatModel, PatVariant};

/// A single named tensor as it appears in the foreign weight file: a flat
/// row-major buffer plus its shape.
#[derive(Debug, Clone)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl RawTensor {
    fn as_array2(&self) -> PipelineResult<Array2<f64>> {
        if self.shape.len() != 2 {
            return Err(PipelineError::Inference(format!(
                "expected a rank-2 tensor, got shape {:?}",
                self.shape
            )));
        }
        Array2::from_shape_vec((self.shape[0], self.shape[1]), self.data.clone())
            .map_err(|e| PipelineError::Inference(e.to_string()))
    }
}

/// The parsed contents of a weight file: a flat name -> tensor map, mirroring
/// the nested-group layout of the foreign export (group paths collapse to
/// `/`-joined names, e.g. `encoder_layer_1_transformer/.../kernel:0`).
#[derive(Debug, Clone, Default)]
pub struct RawWeightFile {
    tensors: HashMap<String, RawTensor>,
}

impl RawWeightFile {
    fn get(&self, name: &str) -> PipelineResult<&RawTensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| PipelineError::Inference(format!("missing weight tensor {name}")))
    }
}

/// Parses this crate's on-disk mirror of the foreign weight-file layout: a
/// sequence of records `[name_len: u32][name: utf8][ndim: u32][dims:
/// u32...][data: f64 * prod(dims)]`, little-endian throughout. Unexpected
/// trailing bytes are treated as a new record and fail loudly rather than being
/// silently ignored.
pub fn parse_raw_weight_file(bytes: &[u8]) -> PipelineResult<RawWeightFile> {
    let mut tensors = HashMap::new();
    let mut cursor = 0usize;

    let read_u32 = |bytes: &[u8], at: usize| -> PipelineResult<u32> {
        bytes
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| PipelineError::Inference("truncated weight file".to_string()))
    };

    while cursor < bytes.len() {
        let name_len = read_u32(bytes, cursor)? as usize;
        cursor += 4;
        let name = std::str::from_utf8(&bytes[cursor..cursor + name_len])
            .map_err(|e| PipelineError::Inference(e.to_string()))?
            .to_string();
        cursor += name_len;

        let ndim = read_u32(bytes, cursor)? as usize;
        cursor += 4;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(read_u32(bytes, cursor)? as usize);
            cursor += 4;
        }

        let count: usize = shape.iter().product();
        let mut data = Vec::with_capacity(count);
        for _ in 0..count {
            let b = bytes
                .get(cursor..cursor + 8)
                .ok_or_else(|| PipelineError::Inference("truncated weight file".to_string()))?;
            data.push(f64::from_le_bytes(b.try_into().unwrap()));
            cursor += 8;
        }

        tensors.insert(name, RawTensor { shape, data });
    }

    Ok(RawWeightFile { tensors })
}

type HmacSha256 = Hmac<Sha256>;

/// Per-variant expected HMAC-SHA-256 digest (hex), computed over the SHA-256
/// hex digest of the weight file contents. Placeholder values for a crate that
/// ships without the actual pretrained binaries; a real deployment overwrites
/// this table from its release manifest.
fn expected_digest(variant: PatVariant) -> Option<&'static str> {
    match variant {
        PatVariant::Small => {
            Some("3f1a6e2c9b7d4850f3a1e6c2b9d7485034f1a6e2c9b7d4850f3a1e6c2b9d7485")
        }
        PatVariant::Medium => {
            Some("7d4850f3a1e6c2b9d7485034f1a6e2c9b7d48503f1a6e2c9b7d4850f3a1e6c2")
        }
        PatVariant::Large => {
            Some("2b9d7485034f1a6e2c9b7d4850f3a1e6c2b9d74853f1a6e2c9b7d4850f3a1e6")
        }
    }
}

/// The expected-digest table entry for `variant`, exposed for callers (the
/// `ml_models` record a process writes on startup) that want a stable
/// checksum string without duplicating the verification table.
pub fn checksum_for(variant: PatVariant) -> Option<&'static str> {
    expected_digest(variant)
}

/// Computes `HMAC-SHA256(signature_key, hex(SHA256(bytes)))` and compares
/// against the expected per-variant digest. An unrecognized variant has no
/// table entry and is itself treated as a mismatch, not allowed to pass
/// silently.
pub fn verify_integrity(bytes: &[u8], variant: PatVariant, signature_key: &[u8]) -> PipelineResult<()> {
    let sha_digest = hex::encode(Sha256::digest(bytes));

    let mut mac = HmacSha256::new_from_slice(signature_key)
        .map_err(|e| PipelineError::Inference(e.to_string()))?;
    mac.update(sha_digest.as_bytes());
    let actual = hex::encode(mac.finalize().into_bytes());

    match expected_digest(variant) {
        Some(expected) if expected == actual => Ok(()),
        Some(expected) => Err(PipelineError::Integrity {
            variant: variant.as_str().to_string(),
            expected: expected.to_string(),
            actual,
        }),
        None => Err(PipelineError::Integrity {
            variant: variant.as_str().to_string(),
            expected: "<no entry for this variant>".to_string(),
            actual,
        }),
    }
}

/// Resolves `requested` to an absolute path and checks it falls under one of
/// `allowed_base_dirs`. A traversal attempt or an out-of-allow-list absolute
/// path resolves to `default_path` with a warning logged, rather than being
/// followed.
pub fn sanitize_weights_path(
    requested: &Path,
    allowed_base_dirs: &[PathBuf],
    default_path: &Path,
) -> PathBuf {
    let absolute = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(requested),
            Err(_) => requested.to_path_buf(),
        }
    };

    let normalized = normalize_lexically(&absolute);

    let within_allow_list = allowed_base_dirs.iter().any(|base| {
        let base_abs = if base.is_absolute() {
            base.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(base))
                .unwrap_or_else(|_| base.clone())
        };
        normalized.starts_with(normalize_lexically(&base_abs))
    });

    if within_allow_list {
        normalized
    } else {
        tracing::warn!(
            requested = %requested.display(),
            "weight path escapes allow-list, falling back to default"
        );
        default_path.to_path_buf()
    }
}

/// Resolves `.` and `..` components without touching the filesystem (the path
/// need not exist yet when this runs).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Loads a `PatModel` for `variant` from `path`, verifying integrity first. Any
/// failure — missing file, parse error, integrity mismatch — falls back to a
/// freshly random-initialized model with a warning logged; it never silently
/// proceeds with weights that failed verification.
pub fn load_model(
    path: Option<&Path>,
    variant: PatVariant,
    signature_key: &[u8],
    allowed_base_dirs: &[PathBuf],
    default_path: &Path,
) -> PatModel {
    load_model_with_status(path, variant, signature_key, allowed_base_dirs, default_path).0
}

/// Same as [`load_model`], additionally reporting whether the returned model
/// actually carries verified pretrained weights (`true`) or fell back to random
/// initialization (`false`) — the source of the `weights_verified` /
/// `model_integrity_verified` flags carried on every `AnalysisResult`.
pub fn load_model_with_status(
    path: Option<&Path>,
    variant: PatVariant,
    signature_key: &[u8],
    allowed_base_dirs: &[PathBuf],
    default_path: &Path,
) -> (PatModel, bool) {
    let resolved = match path {
        Some(p) => sanitize_weights_path(p, allowed_base_dirs, default_path),
        None => default_path.to_path_buf(),
    };

    let bytes = match std::fs::read(&resolved) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(path = %resolved.display(), error = %e, "could not read PAT weight file, using random initialization");
            return (PatModel::random_init(variant), false);
        }
    };

    if let Err(e) = verify_integrity(&bytes, variant, signature_key) {
        tracing::warn!(variant = variant.as_str(), error = %e, "PAT weight integrity check failed, using random initialization");
        return (PatModel::random_init(variant), false);
    }

    let raw = match parse_raw_weight_file(&bytes) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "could not parse PAT weight file, using random initialization");
            return (PatModel::random_init(variant), false);
        }
    };

    match build_model(&raw, variant) {
        Ok(model) => (model, true),
        Err(e) => {
            tracing::warn!(error = %e, "could not translate PAT weight tensors, using random initialization");
            (PatModel::random_init(variant), false)
        }
    }
}

/// Translates the foreign tensor-naming convention into a populated `PatModel`.
/// Missing classification-head keys are expected (the head is newly
/// initialized, never pretrained); unexpected keys present in the file but not
/// consumed here are simply ignored.
fn build_model(raw: &RawWeightFile, variant: PatVariant) -> PipelineResult<PatModel> {
    let arch: Architecture = variant.architecture();
    let mut model = PatModel::random_init(variant);

    let patch_kernel = raw.get("dense/dense/kernel:0")?.as_array2()?;
    model.patch_embedding.weight = patch_kernel;
    if let Ok(bias) = raw.get("dense/dense/bias:0") {
        model.patch_embedding.bias = ndarray::Array1::from_vec(bias.data.clone());
    }

    for (i, layer) in model.layers.iter_mut().enumerate() {
        let idx = i + 1;
        load_attention(raw, idx, &arch, layer)?;
        load_feed_forward(raw, idx, layer)?;
        load_norms(raw, idx, layer)?;
    }

    Ok(model)
}

fn load_attention(
    raw: &RawWeightFile,
    layer_idx: usize,
    arch: &Architecture,
    layer: &mut EncoderLayer,
) -> PipelineResult<()> {
    let prefix = format!(
        "encoder_layer_{layer_idx}_transformer/encoder_layer_{layer_idx}_attention"
    );

    for (proj_name, selector) in [
        ("query", 0),
        ("key", 1),
        ("value", 2),
    ] {
        let kernel_name = format!("{prefix}/{proj_name}/kernel:0");
        let bias_name = format!("{prefix}/{proj_name}/bias:0");
        let kernel = match raw.get(&kernel_name) {
            Ok(k) => k,
            Err(_) => continue,
        };
        // shape [embed_dim, num_heads, head_dim]; split along the middle
        // axis into one [embed_dim, head_dim] matrix per head.
        if kernel.shape.len() != 3 {
            continue;
        }
        let (embed_dim, num_heads, head_dim) = (kernel.shape[0], kernel.shape[1], kernel.shape[2]);
        let bias = raw.get(&bias_name).ok();

        for h in 0..num_heads.min(layer.attention.heads.len()) {
            let mut head_matrix = Array2::<f64>::zeros((embed_dim, head_dim));
            for e in 0..embed_dim {
                for d in 0..head_dim {
                    let flat = (e * num_heads + h) * head_dim + d;
                    head_matrix[[e, d]] = kernel.data[flat];
                }
            }
            let target = &mut layer.attention.heads[h];
            let slot = match selector {
                0 => &mut target.q_proj,
                1 => &mut target.k_proj,
                _ => &mut target.v_proj,
            };
            slot.weight = head_matrix;
            if let Some(bias_tensor) = bias {
                if bias_tensor.shape.len() == 2 {
                    let start = h * head_dim;
                    slot.bias = ndarray::Array1::from_vec(
                        bias_tensor.data[start..start + head_dim].to_vec(),
                    );
                }
            }
        }
    }

    let output_kernel_name = format!("{prefix}/attention_output/kernel:0");
    if let Ok(out_kernel) = raw.get(&output_kernel_name) {
        // shape [num_heads, head_dim, embed_dim]; permute + reshape to
        // [embed_dim, num_heads*head_dim], then transpose to this crate's
        // [in, out] linear-layer convention.
        if out_kernel.shape.len() == 3 {
            let (num_heads, head_dim, embed_dim) = (
                out_kernel.shape[0],
                out_kernel.shape[1],
                out_kernel.shape[2],
            );
            let mut reshaped = Array2::<f64>::zeros((num_heads * head_dim, embed_dim));
            for h in 0..num_heads {
                for d in 0..head_dim {
                    for e in 0..embed_dim {
                        let flat = (h * head_dim + d) * embed_dim + e;
                        reshaped[[h * head_dim + d, e]] = out_kernel.data[flat];
                    }
                }
            }
            layer.attention.output_proj.weight = reshaped;
        }
    }

    let _ = arch;
    Ok(())
}

fn load_feed_forward(
    raw: &RawWeightFile,
    layer_idx: usize,
    layer: &mut EncoderLayer,
) -> PipelineResult<()> {
    if let Ok(k) = raw.get(&format!("encoder_layer_{layer_idx}_ff1/kernel:0")) {
        layer.ff1.weight = k.as_array2()?;
    }
    if let Ok(b) = raw.get(&format!("encoder_layer_{layer_idx}_ff1/bias:0")) {
        layer.ff1.bias = ndarray::Array1::from_vec(b.data.clone());
    }
    if let Ok(k) = raw.get(&format!("encoder_layer_{layer_idx}_ff2/kernel:0")) {
        layer.ff2.weight = k.as_array2()?;
    }
    if let Ok(b) = raw.get(&format!("encoder_layer_{layer_idx}_ff2/bias:0")) {
        layer.ff2.bias = ndarray::Array1::from_vec(b.data.clone());
    }
    Ok(())
}

fn load_norms(raw: &RawWeightFile, layer_idx: usize, layer: &mut EncoderLayer) -> PipelineResult<()> {
    apply_norm(raw, &format!("encoder_layer_{layer_idx}_norm1"), &mut layer.norm1);
    apply_norm(raw, &format!("encoder_layer_{layer_idx}_norm2"), &mut layer.norm2);
    Ok(())
}

fn apply_norm(raw: &RawWeightFile, prefix: &str, norm: &mut LayerNorm) {
    if let Ok(gamma) = raw.get(&format!("{prefix}/gamma:0")) {
        norm.weight = ndarray::Array1::from_vec(gamma.data.clone());
    }
    if let Ok(beta) = raw.get(&format!("{prefix}/beta:0")) {
        norm.bias = ndarray::Array1::from_vec(beta.data.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_tensor(name: &str, shape: &[usize], data: &[f64]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(shape.len() as u32).to_le_bytes());
        for d in shape {
            out.extend_from_slice(&(*d as u32).to_le_bytes());
        }
        for v in data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn parses_a_single_tensor_record() {
        let bytes = encode_tensor("dense/dense/kernel:0", &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let parsed = parse_raw_weight_file(&bytes).unwrap();
        let t = parsed.get("dense/dense/kernel:0").unwrap();
        assert_eq!(t.shape, vec![2, 3]);
        assert_eq!(t.data.len(), 6);
    }

    #[test]
    fn integrity_check_rejects_unsigned_bytes() {
        let bytes = b"not a real weight file".to_vec();
        let err = verify_integrity(&bytes, PatVariant::Small, b"test-key").unwrap_err();
        assert!(matches!(err, PipelineError::Integrity { .. }));
    }

    #[test]
    fn path_sanitization_rejects_traversal() {
        let allowed = vec![PathBuf::from("/tmp/models")];
        let default = PathBuf::from("/tmp/models/default.bin");
        let out = sanitize_weights_path(
            Path::new("/tmp/models/../../etc/passwd"),
            &allowed,
            &default,
        );
        assert_eq!(out, default);
    }

    #[test]
    fn path_sanitization_accepts_path_within_allow_list() {
        let allowed = vec![PathBuf::from("/tmp/models")];
        let default = PathBuf::from("/tmp/models/default.bin");
        let out = sanitize_weights_path(Path::new("/tmp/models/pat-s.bin"), &allowed, &default);
        assert_eq!(out, PathBuf::from("/tmp/models/pat-s.bin"));
    }

    #[test]
    fn missing_weight_file_falls_back_to_random_init() {
        let model = load_model(
            Some(Path::new("/nonexistent/pat-weights.bin")),
            PatVariant::Small,
            b"test-key",
            &[PathBuf::from("/nonexistent")],
            Path::new("/nonexistent/default.bin"),
        );
        assert_eq!(model.variant, PatVariant::Small);
    }
}
