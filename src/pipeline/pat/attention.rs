//! Building blocks for the PAT encoder: plain linear layers, layer norm, and
//! the non-standard per-head attention where each head gets its own full
//! `embed_dim -> head_dim` projection rather than a slice of one shared one.

use ndarray::{Array1, Array2, Axis};

/// `y = x · W + b`, `W` stored as `[in_dim, out_dim]` so the forward pass is a
/// single `dot`.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl LinearLayer {
    pub fn zeros(in_dim: usize, out_dim: usize) -> Self {
        Self {
            weight: Array2::zeros((in_dim, out_dim)),
            bias: Array1::zeros(out_dim),
        }
    }

    pub fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.weight) + &self.bias
    }
}

/// Layer normalization over the last axis, with learned scale/shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f64>,
    pub bias: Array1<f64>,
    pub eps: f64,
}

impl LayerNorm {
    pub fn ones(dim: usize) -> Self {
        Self {
            weight: Array1::ones(dim),
            bias: Array1::zeros(dim),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        let mean = x.mean_axis(Axis(1)).unwrap();
        let mut out = x.clone();
        for (mut row, m) in out.outer_iter_mut().zip(mean.iter()) {
            row.mapv_inplace(|v| v - m);
        }
        let var = out.mapv(|v| v * v).mean_axis(Axis(1)).unwrap();
        for (mut row, v) in out.outer_iter_mut().zip(var.iter()) {
            let denom = (v + self.eps).sqrt();
            row.mapv_inplace(|x| x / denom);
        }
        out * &self.weight + &self.bias
    }
}

/// One attention head's independent Q/K/V projections.
#[derive(Debug, Clone)]
pub struct AttentionHead {
    pub q_proj: LinearLayer,
    pub k_proj: LinearLayer,
    pub v_proj: LinearLayer,
}

impl AttentionHead {
    pub fn zeros(embed_dim: usize, head_dim: usize) -> Self {
        Self {
            q_proj: LinearLayer::zeros(embed_dim, head_dim),
            k_proj: LinearLayer::zeros(embed_dim, head_dim),
            v_proj: LinearLayer::zeros(embed_dim, head_dim),
        }
    }

    fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        let q = self.q_proj.forward(x);
        let k = self.k_proj.forward(x);
        let v = self.v_proj.forward(x);
        let head_dim = q.ncols();
        let scale = 1.0 / (head_dim as f64).sqrt();

        let mut scores = q.dot(&k.t()) * scale;
        softmax_rows(&mut scores);
        scores.dot(&v)
    }
}

fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.outer_iter_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f64 = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
}

/// Concatenate-then-project multi-head attention over per-head independent
/// projections.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub heads: Vec<AttentionHead>,
    pub output_proj: LinearLayer,
}

impl MultiHeadAttention {
    pub fn zeros(embed_dim: usize, num_heads: usize, head_dim: usize) -> Self {
        Self {
            heads: (0..num_heads)
                .map(|_| AttentionHead::zeros(embed_dim, head_dim))
                .collect(),
            output_proj: LinearLayer::zeros(num_heads * head_dim, embed_dim),
        }
    }

    pub fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        let seq_len = x.nrows();
        let head_outputs: Vec<Array2<f64>> = self.heads.iter().map(|h| h.forward(x)).collect();
        let head_dim = head_outputs.first().map(|h| h.ncols()).unwrap_or(0);
        let mut concatenated = Array2::zeros((seq_len, head_dim * self.heads.len()));
        for (i, head_out) in head_outputs.iter().enumerate() {
            concatenated
                .slice_mut(ndarray::s![.., i * head_dim..(i + 1) * head_dim])
                .assign(head_out);
        }
        self.output_proj.forward(&concatenated)
    }
}

/// Standard sinusoidal positional encoding, `PE[pos, 2i] = sin(pos /
/// 10000^(2i/dim))`, `PE[pos, 2i+1] = cos(...)`.
pub fn sinusoidal_positional_encoding(seq_len: usize, dim: usize) -> Array2<f64> {
    let mut pe = Array2::zeros((seq_len, dim));
    for pos in 0..seq_len {
        let mut i = 0;
        while i < dim {
            let div_term = (10000f64).powf(i as f64 / dim as f64);
            pe[[pos, i]] = (pos as f64 / div_term).sin();
            if i + 1 < dim {
                pe[[pos, i + 1]] = (pos as f64 / div_term).cos();
            }
            i += 2;
        }
    }
    pe
}
