//! Cosine-similarity gated blend.
//!
//! Inputs are taken relative to an optional base. For every lane along the
//! last axis the cosine similarity of the two inputs is mapped to a gate
//! `d = ((cos + 1) / 2) ^ (gamma * 25)`, and the interpolated input is scaled
//! by `lerp(d, 1 - d, beta)` before the base is added back.

use ndarray::ArrayD;

use super::ensure_same_shape;
use crate::{OpKind, Result, Tensor};

/// Exponent applied to `gamma` when shaping the similarity gate.
const SIMILARITY_EXPONENT: f64 = 25.0;

/// Lower bound on the product of norms in the cosine denominator.
const COSINE_EPS: f64 = 1e-8;

/// Blend parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendParams {
    /// Interpolation weight from `a` (0) to `b` (1).
    pub alpha: f32,
    /// Interpolation of the gate from `d` (0) to `1 - d` (1).
    pub beta: f32,
    /// Sharpness of the gate.
    pub gamma: f32,
}

/// Blend `a` and `b` relative to `base` (zero when absent).
///
/// All three tensors must share a shape. The result keeps the precision of
/// `base` if given, otherwise that of `a`.
pub fn similarity_blend(
    base: Option<&Tensor>,
    a: &Tensor,
    b: &Tensor,
    params: BlendParams,
) -> Result<Tensor> {
    if let Some(base) = base {
        ensure_same_shape(OpKind::Similarity, base, a)?;
    }
    ensure_same_shape(OpKind::Similarity, a, b)?;

    let precision = base.map_or(a.precision(), Tensor::precision);
    if a.is_empty() {
        return Ok(a.cast(precision));
    }

    let shape = a.shape().to_vec();
    let lane = shape.last().copied().unwrap_or(1);
    let origin: Vec<f64> = match base {
        Some(base) => base.data().iter().map(|&v| f64::from(v)).collect(),
        None => vec![0.0; a.len()],
    };
    let relative = |t: &Tensor| -> Vec<f64> {
        t.data()
            .iter()
            .zip(&origin)
            .map(|(&v, o)| f64::from(v) - o)
            .collect()
    };
    let a_rel = relative(a);
    let b_rel = relative(b);

    let alpha = f64::from(params.alpha);
    let beta = f64::from(params.beta);
    let exponent = f64::from(params.gamma) * SIMILARITY_EXPONENT;

    let mut out = Vec::with_capacity(a.len());
    for ((xs, ys), os) in a_rel
        .chunks_exact(lane)
        .zip(b_rel.chunks_exact(lane))
        .zip(origin.chunks_exact(lane))
    {
        let d = ((cosine(xs, ys) + 1.0) / 2.0).powf(exponent);
        let gate = lerp(d, 1.0 - d, beta);
        out.extend(
            xs.iter()
                .zip(ys)
                .zip(os)
                .map(|((&x, &y), &o)| o + lerp(x, y, alpha) * gate),
        );
    }

    let wide = ArrayD::from_shape_vec(shape, out)?;
    Ok(Tensor::from_wide(&wide, precision))
}

fn cosine(xs: &[f64], ys: &[f64]) -> f64 {
    let dot: f64 = xs.iter().zip(ys).map(|(x, y)| x * y).sum();
    let norm_x = xs.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_y = ys.iter().map(|y| y * y).sum::<f64>().sqrt();
    (dot / (norm_x * norm_y).max(COSINE_EPS)).clamp(-1.0, 1.0)
}

fn lerp(start: f64, end: f64, weight: f64) -> f64 {
    start + (end - start) * weight
}
