//! Weight container: owned bytes plus the parsed tensor directory
//!
//! The container owns the raw weight bytes for its whole lifetime, normally
//! through a read-only memory map. Everything else refers into it through
//! [`TensorView`]s, which are plain offset/length records and never copy.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::info;

use super::types::{GGUFModel, QuantType};
use crate::error::{DeltavoxError, Result};
use crate::quantize::dequantize;

/// Non-owning reference to one tensor inside a [`WeightContainer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    /// Absolute byte offset into the container
    pub offset: usize,
    /// Byte length including block padding
    pub len: usize,
    /// Storage encoding
    pub qtype: QuantType,
    /// Row count (product of outer dimensions)
    pub rows: usize,
    /// Values per row (innermost dimension)
    pub cols: usize,
}

impl TensorView {
    /// Stored bytes per row
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.qtype.byte_len(self.cols)
    }

    /// Total element count
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.rows * self.cols
    }
}

enum Storage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Owned(v) => v,
        }
    }
}

/// Parsed weight file
pub struct WeightContainer {
    directory: GGUFModel,
    storage: Storage,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for WeightContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightContainer")
            .field("tensors", &self.directory.tensors.len())
            .field("metadata", &self.directory.metadata.len())
            .field("bytes", &self.data().len())
            .finish()
    }
}

impl WeightContainer {
    /// Memory-map and parse a container file
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Io`] if the file cannot be opened or mapped,
    /// otherwise any error from [`GGUFModel::from_bytes`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| DeltavoxError::io(path, e))?;

        // SAFETY: the mapping is read-only and lives as long as the container.
        // Modifying the file while mapped is outside what this process controls.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DeltavoxError::io(path, e))?;

        let directory = GGUFModel::from_bytes(&mmap)?;
        info!(
            path = %path.display(),
            tensors = directory.tensors.len(),
            metadata = directory.metadata.len(),
            bytes = mmap.len(),
            "loaded weight container"
        );
        Ok(Self::assemble(directory, Storage::Mapped(mmap)))
    }

    /// Parse a container held in memory
    ///
    /// # Errors
    ///
    /// Any error from [`GGUFModel::from_bytes`].
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let directory = GGUFModel::from_bytes(&data)?;
        Ok(Self::assemble(directory, Storage::Owned(data)))
    }

    fn assemble(directory: GGUFModel, storage: Storage) -> Self {
        let index = directory
            .tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Self {
            directory,
            storage,
            index,
        }
    }

    /// Parsed header, metadata and tensor directory
    #[must_use]
    pub fn directory(&self) -> &GGUFModel {
        &self.directory
    }

    /// Raw container bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.storage.bytes()
    }

    /// View of a tensor, if present
    #[must_use]
    pub fn try_tensor(&self, name: &str) -> Option<TensorView> {
        let info = &self.directory.tensors[*self.index.get(name)?];
        Some(TensorView {
            offset: self.directory.tensor_data_start + info.offset as usize,
            len: info.byte_len(),
            qtype: info.qtype,
            rows: info.rows(),
            cols: info.cols(),
        })
    }

    /// View of a required tensor
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::MissingTensor`] if absent.
    pub fn tensor(&self, name: &str) -> Result<TensorView> {
        self.try_tensor(name)
            .ok_or_else(|| DeltavoxError::MissingTensor {
                name: name.to_string(),
            })
    }

    /// Bytes of a tensor
    ///
    /// Ranges were validated at parse time, so views obtained from this
    /// container are always in bounds.
    #[must_use]
    pub fn bytes(&self, view: &TensorView) -> &[u8] {
        &self.data()[view.offset..view.offset + view.len]
    }

    /// Bytes of one row of a tensor
    #[must_use]
    pub fn row_bytes(&self, view: &TensorView, row: usize) -> &[u8] {
        let rb = view.row_bytes();
        let start = view.offset + row * rb;
        &self.data()[start..start + rb]
    }

    /// Dequantize a whole tensor
    ///
    /// Only used for small tensors such as norm scales and biases.
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::MissingTensor`] if absent.
    pub fn tensor_f32(&self, name: &str) -> Result<Vec<f32>> {
        let view = self.tensor(name)?;
        dequantize(view.qtype, self.bytes(&view), view.element_count())
    }

    /// Tensor names in file order
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.directory.tensors.iter().map(|t| t.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::builder::GGUFBuilder;
    use std::io::Write;

    fn sample() -> Vec<u8> {
        GGUFBuilder::new()
            .architecture("llama")
            .add_f32_tensor("norm", &[4], &[1.0, 2.0, 3.0, 4.0])
            .add_quantized_tensor("w", &[2, 32], QuantType::Q8_0, &[0.5; 64])
            .build()
    }

    #[test]
    fn test_views_point_into_buffer() {
        let container = WeightContainer::from_bytes(sample()).unwrap();
        let norm = container.tensor("norm").unwrap();
        assert_eq!(norm.qtype, QuantType::F32);
        assert_eq!((norm.rows, norm.cols), (1, 4));
        assert_eq!(container.tensor_f32("norm").unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

        let w = container.tensor("w").unwrap();
        assert_eq!(w.len, 68);
        assert_eq!(container.row_bytes(&w, 1).len(), 34);
        assert_eq!(w.offset % 32, 0);
        assert_eq!(container.tensor_names().collect::<Vec<_>>(), vec!["norm", "w"]);
    }

    #[test]
    fn test_missing_tensor() {
        let container = WeightContainer::from_bytes(sample()).unwrap();
        assert!(container.try_tensor("nope").is_none());
        let err = container.tensor("nope").unwrap_err();
        assert!(matches!(err, DeltavoxError::MissingTensor { .. }));
    }

    #[test]
    fn test_load_from_file_maps_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&sample()).unwrap();
        let container = WeightContainer::load(file.path()).unwrap();
        assert_eq!(container.data().len(), sample().len());
        assert_eq!(container.directory().architecture(), Some("llama"));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = WeightContainer::load("/nonexistent/model.gguf").unwrap_err();
        assert!(matches!(err, DeltavoxError::Io { .. }));
    }
}
