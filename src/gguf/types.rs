//! GGUF type definitions and constants
//!
//! This module defines the foundational types for container parsing:
//! - Magic number, version and alignment constants
//! - Storage encoding tags and the [`QuantType`] enum built from them
//! - Core structs: [`GGUFValue`], [`GGUFHeader`], [`TensorInfo`], [`GGUFModel`]

use std::collections::HashMap;

use crate::error::{DeltavoxError, Result};

// ============================================================================
// GGUF Magic and Version Constants
// ============================================================================

/// GGUF magic number: "GGUF" in little-endian
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Oldest accepted GGUF version (64-bit counts)
pub const GGUF_VERSION_V2: u32 = 2;

/// Current GGUF version
pub const GGUF_VERSION_V3: u32 = 3;

/// Default alignment of the tensor data region and of every tensor offset
pub const GGUF_ALIGNMENT: usize = 32;

/// Metadata key overriding [`GGUF_ALIGNMENT`]
pub const GGUF_ALIGNMENT_KEY: &str = "general.alignment";

/// Upper bound on tensor count accepted from a header
pub const MAX_TENSOR_COUNT: u64 = 100_000;

/// Upper bound on metadata entry count accepted from a header
pub const MAX_METADATA_COUNT: u64 = 10_000;

/// Upper bound on metadata array length
pub const MAX_ARRAY_LEN: u64 = 10_000_000;

/// Upper bound on tensor rank
pub const MAX_DIMS: u32 = 8;

// ============================================================================
// Storage Encoding Tags
// ============================================================================

/// GGUF encoding tag: F32 (unquantized float32)
pub const GGUF_TYPE_F32: u32 = 0;

/// GGUF encoding tag: F16 (half precision float16)
pub const GGUF_TYPE_F16: u32 = 1;

/// GGUF encoding tag: `Q4_0` (4-bit blocks of 32)
pub const GGUF_TYPE_Q4_0: u32 = 2;

/// GGUF encoding tag: `Q8_0` (8-bit blocks of 32)
pub const GGUF_TYPE_Q8_0: u32 = 8;

/// GGUF encoding tag: `Q6_K` (6-bit k-quant superblocks of 256)
pub const GGUF_TYPE_Q6_K: u32 = 14;

/// Storage encoding of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum QuantType {
    /// 32-bit float
    F32,
    /// 16-bit IEEE half
    F16,
    /// f16 scale + 16 bytes of nibbles per 32 elements
    Q4_0,
    /// f16 scale + 32 signed bytes per 32 elements
    Q8_0,
    /// 210-byte superblock per 256 elements
    Q6_K,
}

impl QuantType {
    /// Map a container encoding tag to a [`QuantType`]
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::UnsupportedFormat`] for any other tag.
    pub fn from_ggml(tag: u32) -> Result<Self> {
        match tag {
            GGUF_TYPE_F32 => Ok(Self::F32),
            GGUF_TYPE_F16 => Ok(Self::F16),
            GGUF_TYPE_Q4_0 => Ok(Self::Q4_0),
            GGUF_TYPE_Q8_0 => Ok(Self::Q8_0),
            GGUF_TYPE_Q6_K => Ok(Self::Q6_K),
            other => Err(DeltavoxError::UnsupportedFormat {
                what: format!("tensor encoding tag {other}"),
            }),
        }
    }

    /// Container encoding tag for this type
    #[must_use]
    pub const fn ggml_type(self) -> u32 {
        match self {
            Self::F32 => GGUF_TYPE_F32,
            Self::F16 => GGUF_TYPE_F16,
            Self::Q4_0 => GGUF_TYPE_Q4_0,
            Self::Q8_0 => GGUF_TYPE_Q8_0,
            Self::Q6_K => GGUF_TYPE_Q6_K,
        }
    }

    /// Elements per block
    #[must_use]
    pub const fn block_elements(self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            Self::Q4_0 | Self::Q8_0 => 32,
            Self::Q6_K => 256,
        }
    }

    /// Bytes per block
    #[must_use]
    pub const fn block_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => 18,
            Self::Q8_0 => 34,
            Self::Q6_K => 210,
        }
    }

    /// Stored byte length of `elements` values, including block padding
    #[must_use]
    pub const fn byte_len(self, elements: usize) -> usize {
        elements.div_ceil(self.block_elements()) * self.block_bytes()
    }

    /// Human-readable name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::Q4_0 => "Q4_0",
            Self::Q8_0 => "Q8_0",
            Self::Q6_K => "Q6_K",
        }
    }
}

impl std::fmt::Display for QuantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Core GGUF Types
// ============================================================================

/// GGUF metadata value types
#[derive(Debug, Clone, PartialEq)]
pub enum GGUFValue {
    /// Unsigned 8-bit integer
    UInt8(u8),
    /// Signed 8-bit integer
    Int8(i8),
    /// Unsigned 16-bit integer
    UInt16(u16),
    /// Signed 16-bit integer
    Int16(i16),
    /// Unsigned 32-bit integer
    UInt32(u32),
    /// Signed 32-bit integer
    Int32(i32),
    /// 32-bit floating point
    Float32(f32),
    /// Boolean
    Bool(bool),
    /// UTF-8 string
    String(String),
    /// Array of values
    Array(Vec<GGUFValue>),
    /// Unsigned 64-bit integer
    UInt64(u64),
    /// Signed 64-bit integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
}

impl GGUFValue {
    /// Integer value widened to i128, if this is any integer type
    #[must_use]
    pub fn as_integer(&self) -> Option<i128> {
        match *self {
            Self::UInt8(v) => Some(i128::from(v)),
            Self::Int8(v) => Some(i128::from(v)),
            Self::UInt16(v) => Some(i128::from(v)),
            Self::Int16(v) => Some(i128::from(v)),
            Self::UInt32(v) => Some(i128::from(v)),
            Self::Int32(v) => Some(i128::from(v)),
            Self::UInt64(v) => Some(i128::from(v)),
            Self::Int64(v) => Some(i128::from(v)),
            _ => None,
        }
    }

    /// Value as u32 when it is an integer that fits
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        self.as_integer().and_then(|v| u32::try_from(v).ok())
    }

    /// Value as i32 when it is an integer that fits
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        self.as_integer().and_then(|v| i32::try_from(v).ok())
    }

    /// Value as f32; integers convert
    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::Float32(v) => Some(v),
            Self::Float64(v) => Some(v as f32),
            _ => self.as_integer().map(|v| v as f32),
        }
    }

    /// Borrowed string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrowed array elements
    #[must_use]
    pub fn as_array(&self) -> Option<&[GGUFValue]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }
}

/// GGUF file header
#[derive(Debug, Clone, PartialEq)]
pub struct GGUFHeader {
    /// Magic number (must be `GGUF_MAGIC`)
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Number of tensors in the file
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_count: u64,
}

/// Tensor directory entry
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    /// Tensor name
    pub name: String,
    /// Number of dimensions
    pub n_dims: u32,
    /// Dimensions, outermost first (`[rows, cols]` for matrices)
    pub dims: Vec<u64>,
    /// Storage encoding
    pub qtype: QuantType,
    /// Offset relative to the start of the tensor data region
    pub offset: u64,
}

impl TensorInfo {
    /// Total element count
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    /// Length of the innermost (contiguous) dimension
    #[must_use]
    pub fn cols(&self) -> usize {
        self.dims.last().map_or(1, |&d| d as usize)
    }

    /// Product of every dimension except the innermost
    #[must_use]
    pub fn rows(&self) -> usize {
        let n = self.dims.len().saturating_sub(1);
        self.dims[..n].iter().map(|&d| d as usize).product()
    }

    /// Stored byte length
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.rows() * self.qtype.byte_len(self.cols())
    }

    /// Element count and stored byte length, or `None` when either
    /// overflows `usize`
    ///
    /// Dimensions come straight from the file; the loader checks them here
    /// before any unchecked accessor runs.
    #[must_use]
    pub fn checked_sizes(&self) -> Option<(usize, usize)> {
        let dims = self
            .dims
            .iter()
            .map(|&d| usize::try_from(d).ok())
            .collect::<Option<Vec<_>>>()?;
        let (&cols, outer) = dims.split_last()?;
        let rows = outer.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))?;
        let elements = rows.checked_mul(cols)?;
        let row_bytes = cols
            .div_ceil(self.qtype.block_elements())
            .checked_mul(self.qtype.block_bytes())?;
        Some((elements, rows.checked_mul(row_bytes)?))
    }
}

/// Parsed container directory: header, metadata and tensor descriptors
#[derive(Debug, Clone)]
pub struct GGUFModel {
    /// File header
    pub header: GGUFHeader,
    /// Metadata key-value pairs
    pub metadata: HashMap<String, GGUFValue>,
    /// Tensor information, in file order
    pub tensors: Vec<TensorInfo>,
    /// Absolute offset where tensor data starts
    pub tensor_data_start: usize,
    /// Alignment used for the data region and tensor offsets
    pub alignment: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_constant() {
        assert_eq!(GGUF_MAGIC, 0x4655_4747);
        assert_eq!(&GGUF_MAGIC.to_le_bytes(), b"GGUF");
    }

    #[test]
    fn test_quant_type_tags_roundtrip() {
        for qt in [
            QuantType::F32,
            QuantType::F16,
            QuantType::Q4_0,
            QuantType::Q8_0,
            QuantType::Q6_K,
        ] {
            assert_eq!(QuantType::from_ggml(qt.ggml_type()).ok(), Some(qt));
        }
    }

    #[test]
    fn test_unknown_tag_unsupported() {
        // Q4_K is a real GGUF tag but not one this runtime decodes
        let err = QuantType::from_ggml(12).unwrap_err();
        assert!(matches!(err, DeltavoxError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_byte_len_with_padding() {
        assert_eq!(QuantType::Q4_0.byte_len(64), 36);
        assert_eq!(QuantType::Q4_0.byte_len(33), 36);
        assert_eq!(QuantType::Q8_0.byte_len(32), 34);
        assert_eq!(QuantType::Q6_K.byte_len(512), 420);
        assert_eq!(QuantType::F16.byte_len(7), 14);
        assert_eq!(QuantType::F32.byte_len(7), 28);
    }

    #[test]
    fn test_tensor_info_shape() {
        let info = TensorInfo {
            name: "w".to_string(),
            n_dims: 2,
            dims: vec![3, 64],
            qtype: QuantType::Q8_0,
            offset: 0,
        };
        assert_eq!(info.rows(), 3);
        assert_eq!(info.cols(), 64);
        assert_eq!(info.element_count(), 192);
        assert_eq!(info.byte_len(), 3 * 68);

        let vector = TensorInfo {
            dims: vec![16],
            qtype: QuantType::F32,
            ..info
        };
        assert_eq!(vector.rows(), 1);
        assert_eq!(vector.cols(), 16);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(GGUFValue::UInt64(7).as_u32(), Some(7));
        assert_eq!(GGUFValue::Int32(-1).as_u32(), None);
        assert_eq!(GGUFValue::Int32(-1).as_i32(), Some(-1));
        assert_eq!(GGUFValue::UInt32(3).as_f32(), Some(3.0));
        assert_eq!(GGUFValue::String("x".into()).as_str(), Some("x"));
        assert!(GGUFValue::Bool(true).as_u32().is_none());
    }
}
