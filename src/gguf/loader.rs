//! GGUF container parsing
//!
//! Parses the header, metadata section and tensor directory, validates that
//! every tensor lies inside the file at an aligned offset, and exposes typed
//! metadata accessors with defaults.

use std::collections::HashMap;
use std::io::Cursor;

use super::io::{
    read_bool, read_f32, read_f64, read_i16, read_i32, read_i64, read_i8, read_string, read_u16,
    read_u32, read_u64, read_u8,
};
use super::types::{
    GGUFHeader, GGUFModel, GGUFValue, QuantType, TensorInfo, GGUF_ALIGNMENT, GGUF_ALIGNMENT_KEY,
    GGUF_MAGIC, GGUF_VERSION_V2, GGUF_VERSION_V3, MAX_ARRAY_LEN, MAX_DIMS, MAX_METADATA_COUNT,
    MAX_TENSOR_COUNT,
};
use crate::error::{DeltavoxError, Result};

impl GGUFModel {
    /// Parse a GGUF container from bytes
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Parse`] on a bad magic, unsupported version,
    /// truncated input, misaligned or out-of-range tensor, and
    /// [`DeltavoxError::UnsupportedFormat`] on an unknown encoding tag.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let data = std::fs::read("model.gguf")?;
    /// let model = GGUFModel::from_bytes(&data)?;
    /// println!("Loaded {} tensors", model.tensors.len());
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = Self::parse_header(&mut cursor)?;
        let metadata = Self::parse_metadata(&mut cursor, header.metadata_count)?;
        let tensors = Self::parse_tensor_info(&mut cursor, header.tensor_count)?;

        let alignment = match metadata.get(GGUF_ALIGNMENT_KEY).and_then(GGUFValue::as_u32) {
            Some(0) => {
                return Err(DeltavoxError::parse("gguf metadata", "general.alignment is zero"))
            },
            Some(a) => a as usize,
            None => GGUF_ALIGNMENT,
        };

        let current_pos = cursor.position() as usize;
        let tensor_data_start = current_pos.div_ceil(alignment) * alignment;

        let model = Self {
            header,
            metadata,
            tensors,
            tensor_data_start,
            alignment,
        };
        model.validate_ranges(data.len())?;
        Ok(model)
    }

    fn parse_header(cursor: &mut Cursor<&[u8]>) -> Result<GGUFHeader> {
        let magic = read_u32(cursor)?;
        if magic != GGUF_MAGIC {
            return Err(DeltavoxError::parse(
                "gguf header",
                format!("invalid magic 0x{magic:08X}, expected 0x{GGUF_MAGIC:08X}"),
            ));
        }

        let version = read_u32(cursor)?;
        if version != GGUF_VERSION_V3 && version != GGUF_VERSION_V2 {
            return Err(DeltavoxError::parse(
                "gguf header",
                format!("unsupported version {version}, expected 2 or 3"),
            ));
        }

        // Reject corrupted counts before allocating for them
        let tensor_count = read_u64(cursor)?;
        if tensor_count > MAX_TENSOR_COUNT {
            return Err(DeltavoxError::parse(
                "gguf header",
                format!("tensor_count {tensor_count} exceeds maximum {MAX_TENSOR_COUNT}"),
            ));
        }

        let metadata_count = read_u64(cursor)?;
        if metadata_count > MAX_METADATA_COUNT {
            return Err(DeltavoxError::parse(
                "gguf header",
                format!("metadata_count {metadata_count} exceeds maximum {MAX_METADATA_COUNT}"),
            ));
        }

        Ok(GGUFHeader {
            magic,
            version,
            tensor_count,
            metadata_count,
        })
    }

    fn parse_metadata(
        cursor: &mut Cursor<&[u8]>,
        count: u64,
    ) -> Result<HashMap<String, GGUFValue>> {
        let mut metadata = HashMap::new();
        for _ in 0..count {
            let key = read_string(cursor)?;
            let value_type = read_u32(cursor)?;
            let value = Self::read_value(cursor, value_type)?;
            metadata.insert(key, value);
        }
        Ok(metadata)
    }

    fn read_value(cursor: &mut Cursor<&[u8]>, value_type: u32) -> Result<GGUFValue> {
        match value_type {
            0 => Ok(GGUFValue::UInt8(read_u8(cursor)?)),
            1 => Ok(GGUFValue::Int8(read_i8(cursor)?)),
            2 => Ok(GGUFValue::UInt16(read_u16(cursor)?)),
            3 => Ok(GGUFValue::Int16(read_i16(cursor)?)),
            4 => Ok(GGUFValue::UInt32(read_u32(cursor)?)),
            5 => Ok(GGUFValue::Int32(read_i32(cursor)?)),
            6 => Ok(GGUFValue::Float32(read_f32(cursor)?)),
            7 => Ok(GGUFValue::Bool(read_bool(cursor)?)),
            8 => Ok(GGUFValue::String(read_string(cursor)?)),
            9 => {
                let element_type = read_u32(cursor)?;
                if element_type == 9 {
                    return Err(DeltavoxError::parse("gguf metadata", "nested arrays"));
                }
                let array_len = read_u64(cursor)?;
                if array_len > MAX_ARRAY_LEN {
                    return Err(DeltavoxError::parse(
                        "gguf metadata",
                        format!("array length {array_len} exceeds maximum {MAX_ARRAY_LEN}"),
                    ));
                }
                let mut elements = Vec::with_capacity((array_len as usize).min(4096));
                for _ in 0..array_len {
                    elements.push(Self::read_value(cursor, element_type)?);
                }
                Ok(GGUFValue::Array(elements))
            },
            10 => Ok(GGUFValue::UInt64(read_u64(cursor)?)),
            11 => Ok(GGUFValue::Int64(read_i64(cursor)?)),
            12 => Ok(GGUFValue::Float64(read_f64(cursor)?)),
            _ => Err(DeltavoxError::parse(
                "gguf metadata",
                format!("unknown value type {value_type}"),
            )),
        }
    }

    fn parse_tensor_info(cursor: &mut Cursor<&[u8]>, count: u64) -> Result<Vec<TensorInfo>> {
        let mut tensors = Vec::new();

        for _ in 0..count {
            let name = read_string(cursor)?;

            let n_dims = read_u32(cursor)?;
            if n_dims == 0 || n_dims > MAX_DIMS {
                return Err(DeltavoxError::parse(
                    "gguf tensor directory",
                    format!("tensor '{name}' has {n_dims} dimensions, expected 1..={MAX_DIMS}"),
                ));
            }

            // Stored innermost first; reverse to [rows, cols]
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(read_u64(cursor)?);
            }
            dims.reverse();

            let qtype = QuantType::from_ggml(read_u32(cursor)?)?;
            let offset = read_u64(cursor)?;

            let info = TensorInfo {
                name,
                n_dims,
                dims,
                qtype,
                offset,
            };
            if info.checked_sizes().is_none() {
                return Err(DeltavoxError::parse(
                    "gguf tensor directory",
                    format!("tensor '{}' shape {:?} overflows", info.name, info.dims),
                ));
            }
            if !info.cols().is_multiple_of(qtype.block_elements()) {
                return Err(DeltavoxError::parse(
                    "gguf tensor directory",
                    format!(
                        "tensor '{}' row length {} is not a multiple of the {} block size {}",
                        info.name,
                        info.cols(),
                        qtype,
                        qtype.block_elements()
                    ),
                ));
            }
            tensors.push(info);
        }

        Ok(tensors)
    }

    fn validate_ranges(&self, file_len: usize) -> Result<()> {
        for tensor in &self.tensors {
            if !(tensor.offset as usize).is_multiple_of(self.alignment) {
                return Err(DeltavoxError::parse(
                    "gguf tensor directory",
                    format!(
                        "tensor '{}' offset {} is not aligned to {}",
                        tensor.name, tensor.offset, self.alignment
                    ),
                ));
            }
            let Some((_, byte_len)) = tensor.checked_sizes() else {
                return Err(DeltavoxError::parse(
                    "gguf tensor directory",
                    format!("tensor '{}' shape {:?} overflows", tensor.name, tensor.dims),
                ));
            };
            let end = usize::try_from(tensor.offset)
                .ok()
                .and_then(|offset| self.tensor_data_start.checked_add(offset))
                .and_then(|start| start.checked_add(byte_len));
            if end.is_none_or(|end| end > file_len) {
                return Err(DeltavoxError::parse(
                    "gguf tensor directory",
                    format!(
                        "tensor '{}' range at offset {} with {} bytes exceeds file size {}",
                        tensor.name, tensor.offset, byte_len, file_len
                    ),
                ));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Typed metadata accessors
    // =========================================================================

    /// Model architecture (`general.architecture`)
    #[must_use]
    pub fn architecture(&self) -> Option<&str> {
        self.get_string("general.architecture")
    }

    /// Integer metadata value that fits in u32
    #[must_use]
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.metadata.get(key).and_then(GGUFValue::as_u32)
    }

    /// [`Self::get_u32`] with a default
    #[must_use]
    pub fn get_u32_or(&self, key: &str, default: u32) -> u32 {
        self.get_u32(key).unwrap_or(default)
    }

    /// Float metadata value (integers convert)
    #[must_use]
    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.metadata.get(key).and_then(GGUFValue::as_f32)
    }

    /// [`Self::get_f32`] with a default
    #[must_use]
    pub fn get_f32_or(&self, key: &str, default: f32) -> f32 {
        self.get_f32(key).unwrap_or(default)
    }

    /// String metadata value
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(GGUFValue::as_str)
    }

    /// [`Self::get_string`] with a default
    #[must_use]
    pub fn get_string_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_string(key).unwrap_or(default)
    }

    /// Array of strings; `None` if absent or any element is not a string
    #[must_use]
    pub fn get_string_array(&self, key: &str) -> Option<Vec<&str>> {
        self.metadata
            .get(key)
            .and_then(GGUFValue::as_array)?
            .iter()
            .map(GGUFValue::as_str)
            .collect()
    }

    /// Array of integers as i32; `None` if absent or any element does not fit
    #[must_use]
    pub fn get_i32_array(&self, key: &str) -> Option<Vec<i32>> {
        self.metadata
            .get(key)
            .and_then(GGUFValue::as_array)?
            .iter()
            .map(GGUFValue::as_i32)
            .collect()
    }

    /// `{arch}.{suffix}` u32 value
    #[must_use]
    pub fn arch_u32(&self, suffix: &str) -> Option<u32> {
        let arch = self.architecture().unwrap_or("llama");
        self.get_u32(&format!("{arch}.{suffix}"))
    }

    /// `{arch}.{suffix}` f32 value
    #[must_use]
    pub fn arch_f32(&self, suffix: &str) -> Option<f32> {
        let arch = self.architecture().unwrap_or("llama");
        self.get_f32(&format!("{arch}.{suffix}"))
    }

    /// Look up a tensor descriptor by name
    #[must_use]
    pub fn find_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::builder::GGUFBuilder;

    #[test]
    fn test_parse_minimal_header() {
        let data = GGUFBuilder::new().architecture("llama").build();
        let model = GGUFModel::from_bytes(&data).unwrap();
        assert_eq!(model.header.magic, GGUF_MAGIC);
        assert_eq!(model.header.version, GGUF_VERSION_V3);
        assert_eq!(model.architecture(), Some("llama"));
        assert!(model.tensors.is_empty());
        assert_eq!(model.tensor_data_start % GGUF_ALIGNMENT, 0);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = GGUFBuilder::new().build();
        data[0] = b'X';
        let err = GGUFModel::from_bytes(&data).unwrap_err();
        assert!(matches!(err, DeltavoxError::Parse { .. }));
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_bad_version() {
        let mut data = GGUFBuilder::new().build();
        data[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(GGUFModel::from_bytes(&data).is_err());
    }

    #[test]
    fn test_truncated_file() {
        let data = GGUFBuilder::new()
            .architecture("llama")
            .add_f32_tensor("w", &[2, 4], &[0.0; 8])
            .build();
        for cut in [3, 12, 30, data.len() - 1] {
            let err = GGUFModel::from_bytes(&data[..cut]).unwrap_err();
            assert!(matches!(err, DeltavoxError::Parse { .. }), "cut={cut}");
        }
    }

    #[test]
    fn test_unknown_encoding_tag() {
        let data = GGUFBuilder::new()
            .add_raw_tensor("w", &[1, 256], 12, vec![0u8; 144])
            .build();
        let err = GGUFModel::from_bytes(&data).unwrap_err();
        assert!(matches!(err, DeltavoxError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_tensor_count_bound() {
        let mut data = GGUFBuilder::new().build();
        data[8..16].copy_from_slice(&(MAX_TENSOR_COUNT + 1).to_le_bytes());
        assert!(GGUFModel::from_bytes(&data).is_err());
    }

    #[test]
    fn test_metadata_accessors() {
        let data = GGUFBuilder::new()
            .architecture("qwen2")
            .hidden_dim("qwen2", 64)
            .rope_freq_base("qwen2", 1_000_000.0)
            .add_string_array("tokenizer.ggml.tokens", &["a", "b"])
            .add_i32_array("tokenizer.ggml.token_type", &[1, 3])
            .build();
        let model = GGUFModel::from_bytes(&data).unwrap();
        assert_eq!(model.arch_u32("embedding_length"), Some(64));
        assert_eq!(model.arch_f32("rope.freq_base"), Some(1_000_000.0));
        assert_eq!(model.get_u32_or("missing", 9), 9);
        assert!((model.get_f32_or("missing", 0.5) - 0.5).abs() < f32::EPSILON);
        assert_eq!(model.get_string_or("missing", "x"), "x");
        assert_eq!(
            model.get_string_array("tokenizer.ggml.tokens"),
            Some(vec!["a", "b"])
        );
        assert_eq!(
            model.get_i32_array("tokenizer.ggml.token_type"),
            Some(vec![1, 3])
        );
    }

    #[test]
    fn test_tensor_directory() {
        let data = GGUFBuilder::new()
            .add_f32_tensor("a", &[3], &[1.0, 2.0, 3.0])
            .add_f32_tensor("b", &[2, 8], &[0.5; 16])
            .build();
        let model = GGUFModel::from_bytes(&data).unwrap();
        let b = model.find_tensor("b").unwrap();
        assert_eq!(b.dims, vec![2, 8]);
        assert_eq!(b.qtype, QuantType::F32);
        assert_eq!(b.offset as usize % GGUF_ALIGNMENT, 0);
        assert!(model.find_tensor("c").is_none());
    }

    #[test]
    fn test_tensor_past_eof() {
        let mut data = GGUFBuilder::new()
            .add_f32_tensor("a", &[8], &[1.0; 8])
            .build();
        data.truncate(data.len() - 4);
        let err = GGUFModel::from_bytes(&data).unwrap_err();
        assert!(err.to_string().contains("exceeds file size"));
    }

    #[test]
    fn test_misaligned_offset_rejected() {
        // Builder pads to 32; declaring 64 leaves the second tensor misaligned
        let data = GGUFBuilder::new()
            .add_u32("general.alignment", 64)
            .add_f32_tensor("a", &[1], &[1.0])
            .add_f32_tensor("b", &[1], &[2.0])
            .build();
        let err = GGUFModel::from_bytes(&data).unwrap_err();
        assert!(err.to_string().contains("aligned"));
    }

    #[test]
    fn test_quantized_row_must_fill_blocks() {
        let data = GGUFBuilder::new()
            .add_raw_tensor("a", &[1, 20], 8, vec![0u8; 34])
            .build();
        assert!(GGUFModel::from_bytes(&data).is_err());
    }

    #[test]
    fn test_oversized_shape_is_parse_error() {
        let data = GGUFBuilder::new()
            .add_raw_tensor("x", &[1 << 40, 1 << 40], 0, vec![0u8; 4])
            .build();
        let err = GGUFModel::from_bytes(&data).unwrap_err();
        assert!(matches!(err, DeltavoxError::Parse { .. }));
        assert!(err.to_string().contains("overflows"));

        // element count fits; four bytes per element does not
        let data = GGUFBuilder::new()
            .add_raw_tensor("y", &[1 << 62, 1], 0, vec![0u8; 4])
            .build();
        assert!(matches!(
            GGUFModel::from_bytes(&data),
            Err(DeltavoxError::Parse { .. })
        ));
    }
}
