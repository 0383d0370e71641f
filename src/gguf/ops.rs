//! Numeric primitives for the forward pass
//!
//! RMSNorm, softmax, SiLU, arg-max and the rotary position transform.

use super::config::RopeStyle;

/// RMSNorm: `out = x / sqrt(mean(x²) + eps) * weight`
///
/// The sum of squares is accumulated in f64.
pub fn rms_norm_into(x: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) {
    debug_assert_eq!(x.len(), weight.len());
    debug_assert_eq!(x.len(), out.len());
    let sum_sq: f64 = x.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
    let rms = (sum_sq / x.len() as f64 + f64::from(eps)).sqrt();
    let scale = (1.0 / rms) as f32;
    for ((o, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = v * scale * w;
    }
}

/// Numerically stable in-place softmax
///
/// A slice whose entries are all `-inf` becomes uniform.
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        let uniform = 1.0 / x.len() as f32;
        x.fill(uniform);
        return;
    }
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
}

/// SiLU: `x * sigmoid(x)`
#[inline]
#[must_use]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Index of the largest value; ties resolve to the lowest index
#[must_use]
pub fn argmax(x: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in x.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    best
}

/// Dot product
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Rotate every head of `x` for `position`
///
/// Frequency for pair `i` is `theta^(-2i / head_dim)`.
pub fn apply_rope(
    x: &mut [f32],
    num_heads: usize,
    head_dim: usize,
    position: usize,
    theta: f32,
    style: RopeStyle,
) {
    let half_dim = head_dim / 2;
    let pos = position as f32;

    let mut cos_vals = vec![0.0f32; half_dim];
    let mut sin_vals = vec![0.0f32; half_dim];
    for i in 0..half_dim {
        let freq = 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32);
        let (s, c) = (pos * freq).sin_cos();
        cos_vals[i] = c;
        sin_vals[i] = s;
    }

    for head in x.chunks_exact_mut(head_dim).take(num_heads) {
        match style {
            RopeStyle::Neox => {
                let (first, second) = head.split_at_mut(half_dim);
                for i in 0..half_dim {
                    let (x0, x1) = (first[i], second[i]);
                    first[i] = x0 * cos_vals[i] - x1 * sin_vals[i];
                    second[i] = x0 * sin_vals[i] + x1 * cos_vals[i];
                }
            },
            RopeStyle::Norm => {
                for i in 0..half_dim {
                    let (x0, x1) = (head[2 * i], head[2 * i + 1]);
                    head[2 * i] = x0 * cos_vals[i] - x1 * sin_vals[i];
                    head[2 * i + 1] = x0 * sin_vals[i] + x1 * cos_vals[i];
                }
            },
        }
    }
}
