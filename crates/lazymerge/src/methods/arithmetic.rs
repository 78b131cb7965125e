use crate::{MergeError, OpKind, Result, Tensor};

/// `a + b` element-wise.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(OpKind::Add, a, b, |x, y| x + y)
}

/// `a - b` element-wise.
pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    binary(OpKind::Sub, a, b, |x, y| x - y)
}

/// `a * alpha`.
pub fn multiply(a: &Tensor, alpha: f32) -> Tensor {
    a.map(|x| x * alpha)
}

/// Fail with a shape error unless `a` and `b` have identical shapes.
///
/// The key is left empty; the evaluator fills in the failing node's key.
pub(crate) fn ensure_same_shape(kind: OpKind, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() == b.shape() {
        Ok(())
    } else {
        Err(MergeError::ShapeMismatch {
            key: String::new(),
            kind,
            left: a.shape().to_vec(),
            right: b.shape().to_vec(),
        })
    }
}

fn binary(kind: OpKind, a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    ensure_same_shape(kind, a, b)?;
    let precision = a.precision().promote(b.precision());
    Ok(a.zip_map(b, precision, f))
}
