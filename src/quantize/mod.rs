//! Quantization codecs for model weights
//!
//! Implements the storage encodings a weight container may use:
//! - `F32` and `F16`: plain floats
//! - `Q4_0`: 4-bit blocks of 32 values
//! - `Q8_0`: 8-bit blocks of 32 values
//! - `Q6_K`: 6-bit k-quant superblocks of 256 values
//!
//! ## `Q4_0` Format
//!
//! `Q4_0` stores weights in blocks of 32 values:
//! - 1 half-precision scale factor
//! - 16 bytes of 4-bit codes; byte `j` holds slot `j` (low) and `j + 16` (high)
//! - Dequantization: `value = (code - 8) * scale`
//!
//! ## `Q8_0` Format
//!
//! `Q8_0` stores weights in blocks of 32 values:
//! - 1 half-precision scale factor
//! - 32 int8 quantized values
//! - Dequantization: `value = scale * quantized_value`
//!
//! ## `Q6_K` Format
//!
//! `Q6_K` uses superblocks of 256 values divided into 16 sub-blocks of 16:
//! - 128 bytes of low 4-bit planes, 64 bytes of high 2-bit planes
//! - 16 signed 8-bit sub-block scales
//! - 1 trailing half-precision superblock scale `d`
//! - Dequantization: `value = d * scale[sub] * (code - 32)`

pub mod dequant;
pub mod encode;
pub mod matvec;

pub use dequant::{
    dequantize, dequantize_f16, dequantize_f32, dequantize_q4_0, dequantize_q4_0_block,
    dequantize_q6_k, dequantize_q6_k_block, dequantize_q8_0, dequantize_q8_0_block,
    dequantize_row_into, f16_to_f32,
};
pub use encode::{encode_f16, quantize_q4_0, quantize_q6_k, quantize_q8_0};
pub use matvec::{matvec, matvec_f32, matvec_f32_into, matvec_into, par_rows};

/// Block size for `Q4_0` and `Q8_0` quantization
pub const BLOCK_SIZE: usize = 32;

/// Superblock size for `Q6_K`
pub const QK_K: usize = 256;

/// Bytes in one `Q4_0` block
pub const Q4_0_BLOCK_BYTES: usize = 2 + 16;

/// Bytes in one `Q8_0` block
pub const Q8_0_BLOCK_BYTES: usize = 2 + 32;

/// Bytes in one `Q6_K` superblock
pub const Q6_K_BLOCK_BYTES: usize = 128 + 64 + 16 + 2;
