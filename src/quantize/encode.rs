//! Reference quantizers
//!
//! Produce container-layout bytes from f32 values. Used to build synthetic
//! weight files and as the inverse of the block decoders in tests and
//! benchmarks. Inputs that do not fill a final block are zero-padded.

use crate::quantize::{BLOCK_SIZE, QK_K, Q6_K_BLOCK_BYTES};

fn padded_blocks(values: &[f32], block: usize) -> impl Iterator<Item = Vec<f32>> + '_ {
    values.chunks(block).map(move |chunk| {
        let mut padded = chunk.to_vec();
        padded.resize(block, 0.0);
        padded
    })
}

/// Round a scale through f16 so encoder and decoder agree on it
fn f16_scale(scale: f32) -> (f32, [u8; 2]) {
    let h = half::f16::from_f32(scale);
    (h.to_f32(), h.to_le_bytes())
}

/// Quantize to `Q4_0` (18 bytes per 32 values)
///
/// The value with the largest magnitude maps to nibble 0 so its sign is
/// preserved exactly; everything else rounds to the nearest of 16 levels.
#[must_use]
pub fn quantize_q4_0(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().div_ceil(BLOCK_SIZE) * 18);
    for block in padded_blocks(values, BLOCK_SIZE) {
        let max = block
            .iter()
            .copied()
            .fold(0.0f32, |m, v| if v.abs() > m.abs() { v } else { m });
        let (d, bytes) = f16_scale(max / -8.0);
        let inv = if d == 0.0 { 0.0 } else { 1.0 / d };
        out.extend_from_slice(&bytes);

        let code = |v: f32| ((v * inv + 8.5) as i32).clamp(0, 15) as u8;
        for j in 0..16 {
            out.push(code(block[j]) | (code(block[j + 16]) << 4));
        }
    }
    out
}

/// Quantize to `Q8_0` (34 bytes per 32 values)
#[must_use]
pub fn quantize_q8_0(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().div_ceil(BLOCK_SIZE) * 34);
    for block in padded_blocks(values, BLOCK_SIZE) {
        let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let (d, bytes) = f16_scale(amax / 127.0);
        let inv = if d == 0.0 { 0.0 } else { 1.0 / d };
        out.extend_from_slice(&bytes);
        out.extend(
            block
                .iter()
                .map(|&v| (v * inv).round().clamp(-128.0, 127.0) as i8 as u8),
        );
    }
    out
}

/// Quantize to `Q6_K` (210 bytes per 256 values)
///
/// Each 16-value sub-block gets a signed 8-bit scale relative to the f16
/// superblock scale; codes are 6-bit with a bias of 32.
#[must_use]
pub fn quantize_q6_k(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().div_ceil(QK_K) * Q6_K_BLOCK_BYTES);
    for block in padded_blocks(values, QK_K) {
        let mut sub_scales = [0.0f32; 16];
        for (s, sub) in sub_scales.iter_mut().zip(block.chunks_exact(16)) {
            *s = sub.iter().fold(0.0f32, |m, v| m.max(v.abs())) / 31.0;
        }
        let max_scale = sub_scales.iter().fold(0.0f32, |m, &s| m.max(s));
        let (d, d_bytes) = f16_scale(max_scale / 127.0);

        let mut scales = [0i8; 16];
        if d > 0.0 {
            for (q, &s) in scales.iter_mut().zip(&sub_scales) {
                *q = (s / d).round().clamp(-128.0, 127.0) as i8;
            }
        }

        let mut codes = [32u8; QK_K];
        for (e, code) in codes.iter_mut().enumerate() {
            let step = d * f32::from(scales[e / 16]);
            if step != 0.0 {
                *code = ((block[e] / step).round().clamp(-32.0, 31.0) as i32 + 32) as u8;
            }
        }

        let mut packed = [0u8; Q6_K_BLOCK_BYTES];
        for part in 0..2 {
            let c = &codes[128 * part..128 * (part + 1)];
            for l in 0..32 {
                let (q1, q2, q3, q4) = (c[l], c[l + 32], c[l + 64], c[l + 96]);
                packed[64 * part + l] = (q1 & 0xF) | ((q3 & 0xF) << 4);
                packed[64 * part + l + 32] = (q2 & 0xF) | ((q4 & 0xF) << 4);
                packed[128 + 32 * part + l] =
                    (q1 >> 4) | ((q2 >> 4) << 2) | ((q3 >> 4) << 4) | ((q4 >> 4) << 6);
            }
        }
        for (dst, &s) in packed[192..208].iter_mut().zip(&scales) {
            *dst = s as u8;
        }
        packed[208..210].copy_from_slice(&d_bytes);
        out.extend_from_slice(&packed);
    }
    out
}

/// Encode to little-endian F16 storage
#[must_use]
pub fn encode_f16(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
        .collect()
}
