//! Tensor values flowing through a merge graph.
//!
//! A [`Tensor`] stores `f32` elements in a shared `ndarray` buffer tagged with
//! the [`Precision`] it represents. Every element is kept exactly representable
//! in that precision, so a bf16 tensor held here is bit-for-bit what a bf16
//! checkpoint would store. Numerically sensitive operators lift tensors to
//! `f64` with [`Tensor::to_wide`] and come back through [`Tensor::from_wide`].

use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use ndarray::{ArcArray, Array1, ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::{MergeError, Result};

/// Storage precision of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    /// IEEE single precision.
    #[default]
    #[serde(rename = "float32", alias = "fp32", alias = "f32")]
    F32,
    /// IEEE half precision.
    #[serde(rename = "float16", alias = "fp16", alias = "f16")]
    F16,
    /// Brain floating point.
    #[serde(rename = "bfloat16", alias = "bf16")]
    BF16,
}

impl Precision {
    /// Round a value to the nearest representable value of this precision.
    #[inline]
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::F32 => value,
            Self::F16 => f16::from_f32(value).to_f32(),
            Self::BF16 => bf16::from_f32(value).to_f32(),
        }
    }

    /// Round a wide value straight to this precision (single rounding step).
    #[inline]
    pub fn round_wide(self, value: f64) -> f32 {
        match self {
            Self::F32 => value as f32,
            Self::F16 => f16::from_f64(value).to_f32(),
            Self::BF16 => bf16::from_f64(value).to_f32(),
        }
    }

    /// Precision of the result when combining two operands.
    pub fn promote(self, other: Self) -> Self {
        if self == other {
            self
        } else {
            // f16 and bf16 have no common narrower type.
            Self::F32
        }
    }

    /// Bytes per element when stored.
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Canonical name, as used in recipes.
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Precision {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(Self::F32),
            "float16" | "fp16" | "f16" | "half" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            other => Err(MergeError::InvalidConfig(format!(
                "unknown precision '{}', expected float32, float16 or bfloat16",
                other
            ))),
        }
    }
}

/// An immutable n-dimensional weight tensor.
///
/// Cloning is cheap: the element buffer is reference counted.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: ArcArray<f32, IxDyn>,
    precision: Precision,
}

impl Tensor {
    /// Create a tensor, rounding every element to `precision`.
    pub fn new(data: ArrayD<f32>, precision: Precision) -> Self {
        let data = if precision == Precision::F32 {
            data
        } else {
            data.mapv_into(|v| precision.round(v))
        };
        Self {
            data: data.into_shared(),
            precision,
        }
    }

    /// Create a tensor from row-major values.
    pub fn from_shape_vec(shape: &[usize], values: Vec<f32>, precision: Precision) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Self::new(data, precision))
    }

    /// One-dimensional `f32` tensor.
    pub fn from_values(values: &[f32]) -> Self {
        Self::new(Array1::from_vec(values.to_vec()).into_dyn(), Precision::F32)
    }

    /// Build a tensor from wide values, casting to `precision`.
    pub fn from_wide(data: &ArrayD<f64>, precision: Precision) -> Self {
        Self {
            data: data.mapv(|v| precision.round_wide(v)).into_shared(),
            precision,
        }
    }

    /// Shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Storage precision.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Underlying element buffer.
    pub fn data(&self) -> &ArcArray<f32, IxDyn> {
        &self.data
    }

    /// Elements in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Lift to `f64` for numerically sensitive work.
    pub fn to_wide(&self) -> ArrayD<f64> {
        self.data.mapv(f64::from)
    }

    /// Cast to another precision.
    pub fn cast(&self, precision: Precision) -> Self {
        if precision == self.precision {
            return self.clone();
        }
        Self::new(self.data.to_owned(), precision)
    }

    /// Exact element-wise equality (same shape, every element `==`).
    pub fn values_equal(&self, other: &Tensor) -> bool {
        self.shape() == other.shape()
            && Zip::from(&self.data)
                .and(&other.data)
                .all(|&a, &b| a == b)
    }

    /// Approximate buffer size in bytes at the stored precision.
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.precision.size_in_bytes()
    }

    /// Apply `f` element-wise, keeping the precision.
    pub(crate) fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        let precision = self.precision;
        Self {
            data: self.data.mapv(|v| precision.round(f(v))).into_shared(),
            precision,
        }
    }

    /// Combine two same-shaped tensors element-wise. Callers check shapes.
    pub(crate) fn zip_map(
        &self,
        other: &Tensor,
        precision: Precision,
        f: impl Fn(f32, f32) -> f32,
    ) -> Self {
        let data = Zip::from(&self.data)
            .and(&other.data)
            .map_collect(|&a, &b| precision.round(f(a, b)));
        Self {
            data: data.into_shared(),
            precision,
        }
    }
}
