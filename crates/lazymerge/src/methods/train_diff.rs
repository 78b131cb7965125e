//! Trained-difference extraction.
//!
//! The adjustment `b` makes relative to `c` is weighted by how far `b` moved
//! away from `a`. Computing it needs all three sources and is by far the
//! expensive part; `alpha` only scales the result. The adjustment is cached
//! under the node's fingerprint with alpha stripped, so re-running a merge
//! with a different alpha only costs the evaluation of `a` and one
//! multiply-add.

use ndarray::Zip;
use tracing::trace;

use super::{add, ensure_same_shape, multiply};
use crate::{Evaluator, MergeError, Node, OpKind, Precision, Result, Tensor};

/// Empirical gain applied to every adjustment.
pub const TRAIN_DIFF_SCALE: f64 = 1.8;

/// Adjustment to add to `a` for the difference between `b` and `c`.
///
/// Returns `None` when `b` and `c` are exactly equal, in which case there is
/// nothing to transfer. Computed in `f64` and cast to `precision`.
pub fn trained_difference(
    a: &Tensor,
    b: &Tensor,
    c: &Tensor,
    precision: Precision,
) -> Result<Option<Tensor>> {
    ensure_same_shape(OpKind::TrainDiff, a, b)?;
    ensure_same_shape(OpKind::TrainDiff, b, c)?;
    if b.values_equal(c) {
        return Ok(None);
    }

    let (a, b, c) = (a.to_wide(), b.to_wide(), c.to_wide());
    let adjustment = Zip::from(&a)
        .and(&b)
        .and(&c)
        .map_collect(|&a, &b, &c| {
            let diff = b - c;
            let distance_to_c = diff.abs();
            let distance_to_a = (b - a).abs();
            let total = distance_to_c + distance_to_a;
            let ratio = if total == 0.0 { 0.0 } else { distance_to_a / total };
            sign(diff) * ratio * diff.abs() * TRAIN_DIFF_SCALE
        });

    Ok(Some(Tensor::from_wide(&adjustment, precision)))
}

/// Evaluate a trained-difference node with alpha-independent caching.
///
/// `a` is always evaluated. `b` and `c` are only evaluated when the
/// adjustment is not already cached.
pub(crate) fn evaluate(evaluator: &mut Evaluator<'_>, node: &Node, alpha: f32) -> Result<Tensor> {
    let &[a, b, c] = node.sources() else {
        return Err(MergeError::InvalidArity {
            kind: OpKind::TrainDiff,
            key: node.key().to_string(),
            expected: OpKind::TrainDiff.arity(),
            actual: node.sources().len(),
        });
    };

    let a = evaluator.evaluate(a)?;
    let key = evaluator.graph().fingerprint_without_alpha(node)?;

    if let Some(adjustment) = evaluator.cache().lookup(&key) {
        trace!("train_diff '{}': reusing adjustment {}", node.key(), key);
        evaluator.record_cache_hit();
        return add(&a, &multiply(&adjustment, alpha));
    }

    let b = evaluator.evaluate(b)?;
    let c = evaluator.evaluate(c)?;
    match trained_difference(&a, &b, &c, evaluator.settings().precision)? {
        None => Ok(a),
        Some(adjustment) => {
            let adjustment = evaluator.cache().insert(key, adjustment);
            add(&a, &multiply(&adjustment, alpha))
        }
    }
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}
