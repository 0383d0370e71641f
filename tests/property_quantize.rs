//! Property-based tests for the block codecs and matvec kernels
//!
//! These tests use proptest to check that every quantized kernel tracks the
//! f32 reference within the error its encoding allows.

use deltavox::gguf::ops::{rms_norm_into, silu, softmax};
use deltavox::quantize::{
    dequantize_q4_0, dequantize_q8_0, encode_f16, matvec, matvec_f32, quantize_q4_0,
    quantize_q6_k, quantize_q8_0, BLOCK_SIZE, QK_K,
};
use deltavox::QuantType;
use proptest::prelude::*;

fn reference(w: &[f32], x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    matvec_f32(w, x, rows, cols).unwrap()
}

/// Largest |w| per row times the summed |x|
fn error_scale(w: &[f32], x: &[f32], cols: usize) -> Vec<f32> {
    let x_sum: f32 = x.iter().map(|v| v.abs()).sum();
    w.chunks(cols)
        .map(|row| row.iter().fold(0.0f32, |m, v| m.max(v.abs())) * x_sum)
        .collect()
}

fn matrix(rows: usize, cols: usize) -> impl Strategy<Value = (Vec<f32>, Vec<f32>)> {
    (
        prop::collection::vec(-2.0f32..2.0, rows * cols),
        prop::collection::vec(-1.0f32..1.0, cols),
    )
}

#[test]
fn test_f32_matvec_example() {
    let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    assert_eq!(matvec_f32(&w, &[1.0, 1.0, 1.0], 2, 3).unwrap(), vec![6.0, 15.0]);
}

#[test]
fn test_silu_values() {
    assert_eq!(silu(0.0), 0.0);
    assert!((silu(1.0) - 0.731_058_6).abs() < 1e-4);
    assert!((silu(-1.0) + 0.268_941_4).abs() < 1e-4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Unit scale with every nibble at the bias decodes to zeros
    #[test]
    fn test_q4_0_bias_nibbles_decode_to_zero(blocks in 1usize..8) {
        let mut data = Vec::new();
        for _ in 0..blocks {
            data.extend_from_slice(&0x3C00u16.to_le_bytes());
            data.extend_from_slice(&[0x88; 16]);
        }
        let values = dequantize_q4_0(&data).unwrap();
        prop_assert_eq!(values.len(), blocks * BLOCK_SIZE);
        prop_assert!(values.iter().all(|&v| v == 0.0));
    }

    /// Q8_0 decode stays within one quantization step of the input
    #[test]
    fn test_q8_0_reconstruction_error(
        values in prop::collection::vec(-50.0f32..50.0, BLOCK_SIZE * 4),
    ) {
        let decoded = dequantize_q8_0(&quantize_q8_0(&values)).unwrap();
        for (block, out) in values.chunks(BLOCK_SIZE).zip(decoded.chunks(BLOCK_SIZE)) {
            let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let tol = amax / 127.0 + 1e-4;
            for (v, d) in block.iter().zip(out) {
                prop_assert!((v - d).abs() <= tol, "{} vs {} (tol {})", v, d, tol);
            }
        }
    }

    #[test]
    fn test_q8_0_matvec_tracks_reference((w, x) in matrix(8, 64)) {
        let got = matvec(QuantType::Q8_0, &quantize_q8_0(&w), &x, 8, 64).unwrap();
        let want = reference(&w, &x, 8, 64);
        for ((g, r), s) in got.iter().zip(&want).zip(error_scale(&w, &x, 64)) {
            prop_assert!((g - r).abs() <= s / 120.0 + 1e-3, "{} vs {}", g, r);
        }
    }

    #[test]
    fn test_q4_0_matvec_tracks_reference((w, x) in matrix(8, 64)) {
        let got = matvec(QuantType::Q4_0, &quantize_q4_0(&w), &x, 8, 64).unwrap();
        let want = reference(&w, &x, 8, 64);
        for ((g, r), s) in got.iter().zip(&want).zip(error_scale(&w, &x, 64)) {
            prop_assert!((g - r).abs() <= s / 7.0 + 1e-3, "{} vs {}", g, r);
        }
    }

    #[test]
    fn test_q6_k_matvec_tracks_reference((w, x) in matrix(2, QK_K)) {
        let got = matvec(QuantType::Q6_K, &quantize_q6_k(&w), &x, 2, QK_K).unwrap();
        let want = reference(&w, &x, 2, QK_K);
        for ((g, r), s) in got.iter().zip(&want).zip(error_scale(&w, &x, QK_K)) {
            prop_assert!((g - r).abs() <= s / 20.0 + 1e-3, "{} vs {}", g, r);
        }
    }

    #[test]
    fn test_f16_matvec_tracks_reference((w, x) in matrix(4, 32)) {
        let got = matvec(QuantType::F16, &encode_f16(&w), &x, 4, 32).unwrap();
        let want = reference(&w, &x, 4, 32);
        for ((g, r), s) in got.iter().zip(&want).zip(error_scale(&w, &x, 32)) {
            prop_assert!((g - r).abs() <= s * 1e-3 + 1e-4, "{} vs {}", g, r);
        }
    }

    /// Softmax sums to one and keeps the input order
    #[test]
    fn test_softmax_distribution(mut x in prop::collection::vec(-20.0f32..20.0, 1..64)) {
        let input = x.clone();
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        prop_assert!((sum - 1.0).abs() < 1e-5);
        for i in 0..input.len() {
            for j in 0..input.len() {
                if input[i] < input[j] {
                    prop_assert!(x[i] <= x[j]);
                }
            }
        }
    }

    /// RMSNorm with unit weights yields unit root-mean-square
    #[test]
    fn test_rms_norm_unit_rms(x in prop::collection::vec(-10.0f32..10.0, 1..128)) {
        let sum_sq: f32 = x.iter().map(|v| v * v).sum();
        prop_assume!(sum_sq / x.len() as f32 > 1e-2);
        let mut out = vec![0.0; x.len()];
        rms_norm_into(&x, &vec![1.0; x.len()], 1e-6, &mut out);
        let rms = (out.iter().map(|v| v * v).sum::<f32>() / out.len() as f32).sqrt();
        prop_assert!((rms - 1.0).abs() < 1e-3);
    }
}
