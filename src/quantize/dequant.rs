//! Dequantization for the supported storage encodings
//!
//! Block decoders write one block into a caller-supplied buffer; the
//! buffer-level functions validate length and decode a whole byte range.
//!
//! ## Contents
//! - `dequantize_q4_0_block` / `dequantize_q4_0` - 4-bit blocks of 32
//! - `dequantize_q8_0_block` / `dequantize_q8_0` - 8-bit blocks of 32
//! - `dequantize_q6_k_block` / `dequantize_q6_k` - 6-bit superblocks of 256
//! - `dequantize_f16`, `dequantize_f32` - plain float storage
//! - `dequantize` / `dequantize_row_into` - dispatch by [`QuantType`]

use crate::error::{DeltavoxError, Result};
use crate::gguf::QuantType;
use crate::quantize::{BLOCK_SIZE, QK_K, Q4_0_BLOCK_BYTES, Q6_K_BLOCK_BYTES, Q8_0_BLOCK_BYTES};

/// Convert IEEE 754 half-precision bits to f32
#[inline]
#[must_use]
pub fn f16_to_f32(bits: u16) -> f32 {
    half::f16::from_bits(bits).to_f32()
}

#[inline]
pub(crate) fn read_f16(bytes: &[u8]) -> f32 {
    f16_to_f32(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn check_len(data: &[u8], block_bytes: usize, name: &str) -> Result<usize> {
    if !data.len().is_multiple_of(block_bytes) {
        return Err(DeltavoxError::parse(
            format!("{name} data"),
            format!(
                "length {} is not a multiple of block size {}",
                data.len(),
                block_bytes
            ),
        ));
    }
    Ok(data.len() / block_bytes)
}

/// Decode one `Q4_0` block (18 bytes) into 32 values
///
/// Low nibble of byte `j` is slot `j`, high nibble is slot `j + 16`;
/// value = `(nibble - 8) * scale`.
#[inline]
pub fn dequantize_q4_0_block(block: &[u8], out: &mut [f32]) {
    debug_assert!(block.len() >= Q4_0_BLOCK_BYTES && out.len() >= BLOCK_SIZE);
    let scale = read_f16(&block[0..2]);
    let (lo, hi) = out[..BLOCK_SIZE].split_at_mut(16);
    for (j, &byte) in block[2..Q4_0_BLOCK_BYTES].iter().enumerate() {
        lo[j] = (i32::from(byte & 0x0F) - 8) as f32 * scale;
        hi[j] = (i32::from(byte >> 4) - 8) as f32 * scale;
    }
}

/// Decode one `Q8_0` block (34 bytes) into 32 values
#[inline]
pub fn dequantize_q8_0_block(block: &[u8], out: &mut [f32]) {
    debug_assert!(block.len() >= Q8_0_BLOCK_BYTES && out.len() >= BLOCK_SIZE);
    let scale = read_f16(&block[0..2]);
    for (o, &byte) in out[..BLOCK_SIZE].iter_mut().zip(&block[2..Q8_0_BLOCK_BYTES]) {
        *o = f32::from(byte as i8) * scale;
    }
}

/// Decode one `Q6_K` superblock (210 bytes) into 256 values
///
/// Layout: `ql[128]` low 4 bits, `qh[64]` high 2 bits, `scales[16]` signed
/// sub-block scales, `d` f16 superblock scale. Element `e` uses
/// `scales[e / 16]`.
#[inline]
pub fn dequantize_q6_k_block(block: &[u8], out: &mut [f32]) {
    debug_assert!(block.len() >= Q6_K_BLOCK_BYTES && out.len() >= QK_K);
    let ql = &block[0..128];
    let qh = &block[128..192];
    let scales = &block[192..208];
    let d = read_f16(&block[208..210]);

    for part in 0..2 {
        let ql = &ql[64 * part..];
        let qh = &qh[32 * part..];
        let sc = &scales[8 * part..];
        let y = &mut out[128 * part..];

        for l in 0..32 {
            let is = l / 16;
            let q1 = i32::from((ql[l] & 0xF) | ((qh[l] & 3) << 4)) - 32;
            let q2 = i32::from((ql[l + 32] & 0xF) | (((qh[l] >> 2) & 3) << 4)) - 32;
            let q3 = i32::from((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) - 32;
            let q4 = i32::from((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) - 32;

            y[l] = d * f32::from(sc[is] as i8) * q1 as f32;
            y[l + 32] = d * f32::from(sc[is + 2] as i8) * q2 as f32;
            y[l + 64] = d * f32::from(sc[is + 4] as i8) * q3 as f32;
            y[l + 96] = d * f32::from(sc[is + 6] as i8) * q4 as f32;
        }
    }
}

/// Dequantize `Q4_0` data
///
/// # Errors
///
/// Returns error if data length is not a multiple of 18 bytes
pub fn dequantize_q4_0(data: &[u8]) -> Result<Vec<f32>> {
    let blocks = check_len(data, Q4_0_BLOCK_BYTES, "Q4_0")?;
    let mut result = vec![0.0f32; blocks * BLOCK_SIZE];
    for (block, out) in data
        .chunks_exact(Q4_0_BLOCK_BYTES)
        .zip(result.chunks_exact_mut(BLOCK_SIZE))
    {
        dequantize_q4_0_block(block, out);
    }
    Ok(result)
}

/// Dequantize `Q8_0` data
///
/// # Errors
///
/// Returns error if data length is not a multiple of 34 bytes
pub fn dequantize_q8_0(data: &[u8]) -> Result<Vec<f32>> {
    let blocks = check_len(data, Q8_0_BLOCK_BYTES, "Q8_0")?;
    let mut result = vec![0.0f32; blocks * BLOCK_SIZE];
    for (block, out) in data
        .chunks_exact(Q8_0_BLOCK_BYTES)
        .zip(result.chunks_exact_mut(BLOCK_SIZE))
    {
        dequantize_q8_0_block(block, out);
    }
    Ok(result)
}

/// Dequantize `Q6_K` data
///
/// # Errors
///
/// Returns error if data length is not a multiple of 210 bytes
pub fn dequantize_q6_k(data: &[u8]) -> Result<Vec<f32>> {
    let blocks = check_len(data, Q6_K_BLOCK_BYTES, "Q6_K")?;
    let mut result = vec![0.0f32; blocks * QK_K];
    for (block, out) in data
        .chunks_exact(Q6_K_BLOCK_BYTES)
        .zip(result.chunks_exact_mut(QK_K))
    {
        dequantize_q6_k_block(block, out);
    }
    Ok(result)
}

/// Convert F16 storage to f32
///
/// # Errors
///
/// Returns error if data length is odd
pub fn dequantize_f16(data: &[u8]) -> Result<Vec<f32>> {
    check_len(data, 2, "F16")?;
    Ok(data.chunks_exact(2).map(read_f16).collect())
}

/// Convert little-endian F32 storage to f32
///
/// # Errors
///
/// Returns error if data length is not a multiple of 4
pub fn dequantize_f32(data: &[u8]) -> Result<Vec<f32>> {
    check_len(data, 4, "F32")?;
    Ok(data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Dequantize `elements` values stored as `qtype`
///
/// Block padding beyond `elements` is dropped.
///
/// # Errors
///
/// Returns error if the data is shorter than `elements` requires
pub fn dequantize(qtype: QuantType, data: &[u8], elements: usize) -> Result<Vec<f32>> {
    let needed = qtype.byte_len(elements);
    if data.len() < needed {
        return Err(DeltavoxError::parse(
            format!("{qtype} data"),
            format!("{} bytes cannot hold {elements} elements", data.len()),
        ));
    }
    let data = &data[..needed];
    let mut values = match qtype {
        QuantType::F32 => dequantize_f32(data)?,
        QuantType::F16 => dequantize_f16(data)?,
        QuantType::Q4_0 => dequantize_q4_0(data)?,
        QuantType::Q8_0 => dequantize_q8_0(data)?,
        QuantType::Q6_K => dequantize_q6_k(data)?,
    };
    values.truncate(elements);
    Ok(values)
}

/// Decode one stored row into `out`
///
/// `out.len()` is the row length and must be a multiple of the block size.
///
/// # Errors
///
/// Returns error if `row` does not hold exactly one row of `out.len()` values
pub fn dequantize_row_into(qtype: QuantType, row: &[u8], out: &mut [f32]) -> Result<()> {
    let cols = out.len();
    if !cols.is_multiple_of(qtype.block_elements()) || row.len() != qtype.byte_len(cols) {
        return Err(DeltavoxError::DimensionMismatch {
            reason: format!(
                "{qtype} row of {} bytes does not hold {cols} values",
                row.len()
            ),
        });
    }
    let (block_elems, block_bytes) = (qtype.block_elements(), qtype.block_bytes());
    match qtype {
        QuantType::F32 => {
            for (o, b) in out.iter_mut().zip(row.chunks_exact(4)) {
                *o = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
        },
        QuantType::F16 => {
            for (o, b) in out.iter_mut().zip(row.chunks_exact(2)) {
                *o = read_f16(b);
            }
        },
        QuantType::Q4_0 | QuantType::Q8_0 | QuantType::Q6_K => {
            let decode: fn(&[u8], &mut [f32]) = match qtype {
                QuantType::Q4_0 => dequantize_q4_0_block,
                QuantType::Q8_0 => dequantize_q8_0_block,
                _ => dequantize_q6_k_block,
            };
            for (block, chunk) in row
                .chunks_exact(block_bytes)
                .zip(out.chunks_exact_mut(block_elems))
            {
                decode(block, chunk);
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q4_0_block(scale: f32, nibbles: [u8; 16]) -> Vec<u8> {
        let mut block = half::f16::from_f32(scale).to_le_bytes().to_vec();
        block.extend_from_slice(&nibbles);
        block
    }

    #[test]
    fn test_q4_0_bias_nibbles_decode_to_zero() {
        // scale 1.0 (0x3C00), every nibble 8
        let mut block = vec![0x00, 0x3C];
        block.extend_from_slice(&[0x88; 16]);
        let values = dequantize_q4_0(&block).unwrap();
        assert_eq!(values.len(), 32);
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_q4_0_nibble_order() {
        // byte 0: low nibble 9 (slot 0 -> +1), high nibble 6 (slot 16 -> -2)
        let mut nibbles = [0x88u8; 16];
        nibbles[0] = 0x69;
        let values = dequantize_q4_0(&q4_0_block(0.5, nibbles)).unwrap();
        assert!((values[0] - 0.5).abs() < 1e-6);
        assert!((values[16] + 1.0).abs() < 1e-6);
        assert_eq!(values[1], 0.0);
    }

    #[test]
    fn test_q4_0_invalid_length() {
        assert!(dequantize_q4_0(&[0u8; 17]).is_err());
    }

    #[test]
    fn test_q8_0_signed_values() {
        let mut block = half::f16::from_f32(0.25).to_le_bytes().to_vec();
        for i in 0..32i8 {
            block.push((i - 16) as u8);
        }
        let values = dequantize_q8_0(&block).unwrap();
        assert!((values[0] + 4.0).abs() < 1e-6);
        assert!((values[31] - 3.75).abs() < 1e-6);
    }

    #[test]
    fn test_q6_k_layout() {
        let mut block = vec![0u8; Q6_K_BLOCK_BYTES];
        // every code = 32 -> zero, except element 0 (code 33) and element 64 (code 0)
        for byte in &mut block[128..192] {
            *byte = 0b1010_1010; // high bits = 2 for all four lanes
        }
        block[0] = 0x01; // element 0 low nibble 1, element 64 low nibble 0
        block[128] = 0b1000_1010; // element 64 high bits 0 (lane 2 at bits 4..6)
        for (i, s) in block[192..208].iter_mut().enumerate() {
            *s = (i + 1) as u8;
        }
        block[208..210].copy_from_slice(&half::f16::from_f32(0.5).to_le_bytes());

        let values = dequantize_q6_k(&block).unwrap();
        assert_eq!(values.len(), QK_K);
        // element 0: scale[0]=1, q=1 -> 0.5
        assert!((values[0] - 0.5).abs() < 1e-6);
        // element 64: scale[4]=5, q=-32 -> 0.5*5*-32
        assert!((values[64] + 80.0).abs() < 1e-4);
        assert_eq!(values[1], 0.0);
        assert_eq!(values[255], 0.0);
    }

    #[test]
    fn test_f16_and_f32() {
        let mut f16_bytes = Vec::new();
        for v in [1.0f32, -2.5, 0.0] {
            f16_bytes.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
        }
        assert_eq!(dequantize_f16(&f16_bytes).unwrap(), vec![1.0, -2.5, 0.0]);
        assert!(dequantize_f16(&[0u8; 3]).is_err());

        let f32_bytes: Vec<u8> = [3.0f32, 4.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(dequantize_f32(&f32_bytes).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_row_decode_matches_buffer_decode() {
        let mut data = q4_0_block(0.1, [0x3C; 16]);
        data.extend(q4_0_block(-0.2, [0xA1; 16]));
        let mut row = vec![0.0f32; 64];
        dequantize_row_into(QuantType::Q4_0, &data, &mut row).unwrap();
        assert_eq!(row, dequantize_q4_0(&data).unwrap());

        let mut wrong = vec![0.0f32; 32];
        assert!(dequantize_row_into(QuantType::Q4_0, &data, &mut wrong).is_err());
    }

    #[test]
    fn test_dispatch_truncates_padding() {
        let data: Vec<u8> = (0..5).flat_map(|i| (i as f32).to_le_bytes()).collect();
        let values = dequantize(QuantType::F32, &data, 3).unwrap();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
        assert!(dequantize(QuantType::Q8_0, &[0u8; 10], 32).is_err());
    }
}
