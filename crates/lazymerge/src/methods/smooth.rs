//! Median then Gaussian smoothing of a weight tensor.
//!
//! Both filters work on every axis of the tensor with `reflect` boundary
//! handling (the edge element is repeated: `d c b a | a b c d | d c b a`).
//! The median uses a full 3-wide window per axis; the Gaussian is separable
//! with sigma 1, truncated at 4 sigma.

use ndarray::{ArrayD, Axis, IxDyn, Zip};

use crate::{Precision, Tensor};

const MEDIAN_WINDOW: usize = 3;
const GAUSSIAN_SIGMA: f64 = 1.0;
const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// Median-filter then Gaussian-filter `input` in `f64`, cast to `precision`.
pub fn smooth(input: &Tensor, precision: Precision) -> Tensor {
    let wide = input.to_wide();
    let filtered = gaussian_filter(&median_filter(&wide), GAUSSIAN_SIGMA);
    Tensor::from_wide(&filtered, precision)
}

/// Median over the 3x3x... neighbourhood of every element.
pub fn median_filter(input: &ArrayD<f64>) -> ArrayD<f64> {
    let shape = input.shape().to_vec();
    let ndim = shape.len();
    if ndim == 0 || input.is_empty() {
        return input.clone();
    }

    let window = MEDIAN_WINDOW.pow(ndim as u32);
    let radius = (MEDIAN_WINDOW / 2) as isize;
    let mut neighbourhood = Vec::with_capacity(window);
    let mut probe = vec![0usize; ndim];

    ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
        neighbourhood.clear();
        for code in 0..window {
            let mut rest = code;
            for axis in 0..ndim {
                let offset = (rest % MEDIAN_WINDOW) as isize - radius;
                rest /= MEDIAN_WINDOW;
                probe[axis] = reflect_index(idx[axis] as isize + offset, shape[axis]);
            }
            neighbourhood.push(input[IxDyn(&probe)]);
        }
        let (_, median, _) = neighbourhood.select_nth_unstable_by(window / 2, f64::total_cmp);
        *median
    })
}

/// Separable Gaussian filter along every axis.
pub fn gaussian_filter(input: &ArrayD<f64>, sigma: f64) -> ArrayD<f64> {
    let kernel = gaussian_kernel(sigma, GAUSSIAN_TRUNCATE);
    let radius = (kernel.len() / 2) as isize;
    let mut output = input.clone();

    for axis in 0..input.ndim() {
        let source = output.clone();
        Zip::from(source.lanes(Axis(axis)))
            .and(output.lanes_mut(Axis(axis)))
            .for_each(|src, mut dst| {
                let n = src.len();
                for i in 0..n {
                    dst[i] = kernel
                        .iter()
                        .enumerate()
                        .map(|(k, w)| w * src[reflect_index(i as isize + k as isize - radius, n)])
                        .sum();
                }
            });
    }

    output
}

fn gaussian_kernel(sigma: f64, truncate: f64) -> Vec<f64> {
    let radius = (truncate * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Map an out-of-range index back into `0..len` by mirroring about the edges.
fn reflect_index(index: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * len as isize;
    let folded = index.rem_euclid(period);
    if folded < len as isize {
        folded as usize
    } else {
        (period - 1 - folded) as usize
    }
}
