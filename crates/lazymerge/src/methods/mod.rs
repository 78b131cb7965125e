//! Operator implementations.
//!
//! Every operator except `load` and `train_diff` is a pure function of its
//! evaluated sources, dispatched from [`apply`]. Trained difference manages
//! its own two-tier caching and is driven by the evaluator directly.
//!
//! - **arithmetic**: add, sub, multiply at working precision
//! - **smooth**: median then Gaussian filtering in `f64`
//! - **similarity**: cosine-similarity gated blend in `f64`
//! - **train_diff**: distance-weighted trained difference in `f64`

mod arithmetic;
mod similarity;
mod smooth;
pub(crate) mod train_diff;

pub use arithmetic::{add, multiply, sub};
pub use similarity::{similarity_blend, BlendParams};
pub use smooth::{gaussian_filter, median_filter, smooth};
pub use train_diff::trained_difference;

pub(crate) use arithmetic::ensure_same_shape;

use crate::{MergeError, MergeSettings, OpKind, Operation, Result, Tensor};

/// Apply a pure operator to already evaluated sources.
pub(crate) fn apply(op: &Operation, inputs: &[Tensor], settings: &MergeSettings) -> Result<Tensor> {
    match (op, inputs) {
        (Operation::Multiply { alpha }, [a]) => Ok(multiply(a, *alpha)),
        (Operation::Add, [a, b]) => add(a, b),
        (Operation::Sub, [a, b]) => sub(a, b),
        (Operation::Smooth, [a]) => Ok(smooth(a, settings.precision)),
        (Operation::Similarity { alpha, beta, gamma }, sources) => {
            let params = BlendParams {
                alpha: *alpha,
                beta: *beta,
                gamma: *gamma,
            };
            match sources {
                [a, b] => similarity_blend(None, a, b, params),
                [base, a, b] => similarity_blend(Some(base), a, b, params),
                _ => Err(arity_error(OpKind::Similarity, sources.len())),
            }
        }
        (op, sources) => Err(arity_error(op.kind(), sources.len())),
    }
}

fn arity_error(kind: OpKind, actual: usize) -> MergeError {
    MergeError::InvalidArity {
        kind,
        key: String::new(),
        expected: kind.arity(),
        actual,
    }
}
