//! Fused matrix-vector kernels
//!
//! `out[row] = dot(weight_row, x)` for every storage encoding. Quantized
//! rows are decoded one block at a time and folded straight into the
//! accumulator; no full row is ever materialized.
//!
//! All kernels share [`par_rows`]: rows are split into one contiguous chunk
//! per pool worker and joined before returning. Each row is computed by
//! the same sequential code whatever the split, so single- and
//! multi-threaded results are bit-identical.

use rayon::prelude::*;

use crate::error::{DeltavoxError, Result};
use crate::gguf::QuantType;
use crate::quantize::dequant::read_f16;
use crate::quantize::{BLOCK_SIZE, QK_K, Q4_0_BLOCK_BYTES, Q6_K_BLOCK_BYTES, Q8_0_BLOCK_BYTES};

/// Below `PARALLEL_ROWS_PER_WORKER * workers` rows the kernels stay on the caller's thread
pub const PARALLEL_ROWS_PER_WORKER: usize = 4;

/// Apply `f(row, &mut out[row])` to every output slot, fanning out across the pool
///
/// Uses the current rayon pool, so callers can pin a thread count with
/// `ThreadPool::install`.
pub fn par_rows<F>(out: &mut [f32], f: F)
where
    F: Fn(usize, &mut f32) + Sync,
{
    let rows = out.len();
    let workers = rayon::current_num_threads().max(1);

    if workers == 1 || rows < PARALLEL_ROWS_PER_WORKER * workers {
        for (row, slot) in out.iter_mut().enumerate() {
            f(row, slot);
        }
        return;
    }

    let chunk = rows.div_ceil(workers);
    out.par_chunks_mut(chunk)
        .enumerate()
        .for_each(|(ci, slots)| {
            let base = ci * chunk;
            for (i, slot) in slots.iter_mut().enumerate() {
                f(base + i, slot);
            }
        });
}

// ============================================================================
// Row dot products
// ============================================================================

/// Dot of one F32 row stored as little-endian bytes
#[inline]
#[must_use]
pub fn dot_f32_row(row: &[u8], x: &[f32]) -> f32 {
    row.chunks_exact(4)
        .zip(x)
        .map(|(b, &xv)| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * xv)
        .sum()
}

/// Dot of one F16 row
#[inline]
#[must_use]
pub fn dot_f16_row(row: &[u8], x: &[f32]) -> f32 {
    row.chunks_exact(2)
        .zip(x)
        .map(|(b, &xv)| read_f16(b) * xv)
        .sum()
}

/// Dot of one `Q4_0` row
#[inline]
#[must_use]
pub fn dot_q4_0_row(row: &[u8], x: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (block, xb) in row
        .chunks_exact(Q4_0_BLOCK_BYTES)
        .zip(x.chunks_exact(BLOCK_SIZE))
    {
        let d = read_f16(&block[0..2]);
        let mut acc = 0.0f32;
        for (j, &byte) in block[2..].iter().enumerate() {
            acc += (i32::from(byte & 0x0F) - 8) as f32 * xb[j];
            acc += (i32::from(byte >> 4) - 8) as f32 * xb[j + 16];
        }
        sum += d * acc;
    }
    sum
}

/// Dot of one `Q8_0` row
#[inline]
#[must_use]
pub fn dot_q8_0_row(row: &[u8], x: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (block, xb) in row
        .chunks_exact(Q8_0_BLOCK_BYTES)
        .zip(x.chunks_exact(BLOCK_SIZE))
    {
        let d = read_f16(&block[0..2]);
        let acc: f32 = block[2..]
            .iter()
            .zip(xb)
            .map(|(&q, &xv)| f32::from(q as i8) * xv)
            .sum();
        sum += d * acc;
    }
    sum
}

/// Dot of one `Q6_K` row
#[inline]
#[must_use]
pub fn dot_q6_k_row(row: &[u8], x: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (block, xb) in row.chunks_exact(Q6_K_BLOCK_BYTES).zip(x.chunks_exact(QK_K)) {
        let ql = &block[0..128];
        let qh = &block[128..192];
        let scales = &block[192..208];
        let d = read_f16(&block[208..210]);

        let mut acc = 0.0f32;
        for part in 0..2 {
            let ql = &ql[64 * part..];
            let qh = &qh[32 * part..];
            let sc = &scales[8 * part..];
            let y = &xb[128 * part..];

            for l in 0..32 {
                let is = l / 16;
                let q1 = i32::from((ql[l] & 0xF) | ((qh[l] & 3) << 4)) - 32;
                let q2 = i32::from((ql[l + 32] & 0xF) | (((qh[l] >> 2) & 3) << 4)) - 32;
                let q3 = i32::from((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) - 32;
                let q4 = i32::from((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) - 32;

                acc += f32::from(sc[is] as i8) * q1 as f32 * y[l];
                acc += f32::from(sc[is + 2] as i8) * q2 as f32 * y[l + 32];
                acc += f32::from(sc[is + 4] as i8) * q3 as f32 * y[l + 64];
                acc += f32::from(sc[is + 6] as i8) * q4 as f32 * y[l + 96];
            }
        }
        sum += d * acc;
    }
    sum
}

// ============================================================================
// Matrix-vector entry points
// ============================================================================

fn check_dims(weights: usize, expected: usize, x: usize, cols: usize, what: &str) -> Result<()> {
    if weights != expected {
        return Err(DeltavoxError::DimensionMismatch {
            reason: format!("{what} weights are {weights} bytes, expected {expected}"),
        });
    }
    if x != cols {
        return Err(DeltavoxError::DimensionMismatch {
            reason: format!("{what} input length {x} doesn't match {cols} columns"),
        });
    }
    Ok(())
}

/// `out = W · x` for `W` stored as `qtype` with `out.len()` rows of `cols` values
///
/// # Errors
///
/// Returns [`DeltavoxError::DimensionMismatch`] if the weight length, input
/// length or row length disagree with the declared shape.
pub fn matvec_into(
    qtype: QuantType,
    weights: &[u8],
    x: &[f32],
    cols: usize,
    out: &mut [f32],
) -> Result<()> {
    if !cols.is_multiple_of(qtype.block_elements()) {
        return Err(DeltavoxError::DimensionMismatch {
            reason: format!(
                "{qtype} rows of {cols} values do not fill {}-element blocks",
                qtype.block_elements()
            ),
        });
    }
    let row_bytes = qtype.byte_len(cols);
    check_dims(weights.len(), out.len() * row_bytes, x.len(), cols, qtype.name())?;

    let dot: fn(&[u8], &[f32]) -> f32 = match qtype {
        QuantType::F32 => dot_f32_row,
        QuantType::F16 => dot_f16_row,
        QuantType::Q4_0 => dot_q4_0_row,
        QuantType::Q8_0 => dot_q8_0_row,
        QuantType::Q6_K => dot_q6_k_row,
    };
    par_rows(out, |row, slot| {
        *slot = dot(&weights[row * row_bytes..(row + 1) * row_bytes], x);
    });
    Ok(())
}

/// Allocating form of [`matvec_into`]
///
/// # Errors
///
/// See [`matvec_into`].
pub fn matvec(
    qtype: QuantType,
    weights: &[u8],
    x: &[f32],
    rows: usize,
    cols: usize,
) -> Result<Vec<f32>> {
    let mut out = vec![0.0f32; rows];
    matvec_into(qtype, weights, x, cols, &mut out)?;
    Ok(out)
}

/// `out = W · x` for an in-memory row-major f32 matrix
///
/// # Errors
///
/// Returns [`DeltavoxError::DimensionMismatch`] on inconsistent shapes.
pub fn matvec_f32_into(weights: &[f32], x: &[f32], cols: usize, out: &mut [f32]) -> Result<()> {
    check_dims(weights.len(), out.len() * cols, x.len(), cols, "F32")?;
    par_rows(out, |row, slot| {
        *slot = weights[row * cols..(row + 1) * cols]
            .iter()
            .zip(x)
            .map(|(w, v)| w * v)
            .sum();
    });
    Ok(())
}

/// Allocating form of [`matvec_f32_into`]
///
/// # Errors
///
/// See [`matvec_f32_into`].
pub fn matvec_f32(weights: &[f32], x: &[f32], rows: usize, cols: usize) -> Result<Vec<f32>> {
    let mut out = vec![0.0f32; rows];
    matvec_f32_into(weights, x, cols, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::encode::{encode_f16, quantize_q4_0, quantize_q6_k, quantize_q8_0};

    fn weights(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|i| (((i * 7919) % 211) as f32 - 105.0) / 150.0)
            .collect()
    }

    fn input(cols: usize) -> Vec<f32> {
        (0..cols).map(|i| ((i % 13) as f32 - 6.0) / 8.0).collect()
    }

    #[test]
    fn test_f32_reference_small() {
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = matvec_f32(&w, &[1.0, 1.0, 1.0], 2, 3).unwrap();
        assert_eq!(out, vec![6.0, 15.0]);

        let bytes: Vec<u8> = w.iter().flat_map(|v| v.to_le_bytes()).collect();
        let out = matvec(QuantType::F32, &bytes, &[1.0, 1.0, 1.0], 2, 3).unwrap();
        assert_eq!(out, vec![6.0, 15.0]);
    }

    #[test]
    fn test_quantized_kernels_track_reference() {
        let (rows, cols) = (24, 512);
        let w = weights(rows, cols);
        let x = input(cols);
        let reference = matvec_f32(&w, &x, rows, cols).unwrap();
        let scale = x.iter().map(|v| v.abs()).sum::<f32>();

        let cases = [
            (QuantType::F16, encode_f16(&w), 0.002),
            (QuantType::Q8_0, quantize_q8_0(&w), 0.01),
            (QuantType::Q6_K, quantize_q6_k(&w), 0.03),
            (QuantType::Q4_0, quantize_q4_0(&w), 0.1),
        ];
        for (qtype, bytes, tol) in cases {
            let out = matvec(qtype, &bytes, &x, rows, cols).unwrap();
            for (a, b) in out.iter().zip(&reference) {
                assert!((a - b).abs() <= tol * scale, "{qtype}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_fused_matches_dequantized_dot() {
        let (rows, cols) = (3, 256);
        let w = weights(rows, cols);
        let x = input(cols);
        let bytes = quantize_q6_k(&w);
        let dense = crate::quantize::dequantize_q6_k(&bytes).unwrap();
        let expected = matvec_f32(&dense, &x, rows, cols).unwrap();
        let out = matvec(QuantType::Q6_K, &bytes, &x, rows, cols).unwrap();
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_shape_errors() {
        let bytes = quantize_q8_0(&[0.0; 64]);
        let mut out = vec![0.0; 2];
        assert!(matvec_into(QuantType::Q8_0, &bytes, &[0.0; 31], 32, &mut out).is_err());
        assert!(matvec_into(QuantType::Q8_0, &bytes, &[0.0; 16], 16, &mut out).is_err());
        let mut three = vec![0.0; 3];
        assert!(matvec_into(QuantType::Q8_0, &bytes, &[0.0; 32], 32, &mut three).is_err());
        assert!(matvec_f32(&[1.0; 5], &[1.0; 3], 2, 3).is_err());
    }

    #[test]
    fn test_thread_count_invariance() {
        let (rows, cols) = (257, 256);
        let w = weights(rows, cols);
        let x = input(cols);
        let q4 = quantize_q4_0(&w);
        let q6 = quantize_q6_k(&w);

        let run = |threads: usize| {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap();
            pool.install(|| {
                (
                    matvec(QuantType::Q4_0, &q4, &x, rows, cols).unwrap(),
                    matvec(QuantType::Q6_K, &q6, &x, rows, cols).unwrap(),
                    matvec_f32(&w, &x, rows, cols).unwrap(),
                )
            })
        };
        let single = run(1);
        let multi = run(8);
        assert_eq!(single, multi);
    }

    #[test]
    fn test_par_rows_visits_every_row_once() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap();
        let mut out = vec![0.0f32; 1000];
        pool.install(|| par_rows(&mut out, |row, slot| *slot += row as f32));
        assert!(out.iter().enumerate().all(|(i, &v)| v == i as f32));
    }
}
