//! Delta Voice: low-rank logits correction
//!
//! A rank-r factorization of the difference between two output projections,
//! `ΔW ≈ A · B` with `A: [vocab, rank]` and `B: [rank, hidden]`, blended in
//! at generation time:
//!
//! ```text
//! logits += alpha · A · (B · hidden)
//! ```
//!
//! `alpha = 0` leaves the logits untouched; `alpha = 1` applies the full
//! correction. Cost per token is `rank × (vocab + hidden)` multiply-adds.
//!
//! The factors ship as a NumPy `.npz` archive (a zip of `.npy` files) with
//! entries `A.npy` and `B.npy`; other entries are ignored.

pub mod npy;

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use tracing::info;

use crate::error::{DeltavoxError, Result};
use crate::gguf::ops::dot;
use crate::quantize::{matvec_f32_into, par_rows};

pub use npy::{read_npy, write_npy, NpyArray, NpyDtype};

/// Archive entry holding the output-side factor
pub const FACTOR_A: &str = "A.npy";
/// Archive entry holding the input-side factor
pub const FACTOR_B: &str = "B.npy";

/// Rank-r correction to the output projection
#[derive(Debug, Clone)]
pub struct DeltaVoice {
    vocab_size: usize,
    hidden_dim: usize,
    rank: usize,
    /// `[vocab_size, rank]`, row-major
    a: Vec<f32>,
    /// `[rank, hidden_dim]`, row-major
    b: Vec<f32>,
    /// `B · hidden`
    scratch: Vec<f32>,
}

fn read_entry<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
    context: &str,
) -> Result<NpyArray> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| DeltavoxError::parse(context, format!("{name}: {e}")))?;
    let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| DeltavoxError::parse(context, format!("{name}: {e}")))?;
    read_npy(&bytes, name)
}

impl DeltaVoice {
    /// Load `A.npy` and `B.npy` from an `.npz` archive
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Io`] if the file cannot be opened,
    /// [`DeltavoxError::Parse`] for a malformed archive or array, and
    /// [`DeltavoxError::DimensionMismatch`] if the factor ranks disagree.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| DeltavoxError::io(path, e))?;
        let voice = Self::from_reader(file, &path.display().to_string())?;
        info!(
            path = %path.display(),
            vocab = voice.vocab_size,
            hidden = voice.hidden_dim,
            rank = voice.rank,
            a_mib = (voice.a.len() * 4) as f64 / (1024.0 * 1024.0),
            b_mib = (voice.b.len() * 4) as f64 / (1024.0 * 1024.0),
            "loaded delta voice"
        );
        Ok(voice)
    }

    /// Read the factors from any seekable `.npz` stream
    ///
    /// # Errors
    ///
    /// See [`DeltaVoice::load`].
    pub fn from_reader<R: Read + Seek>(reader: R, context: &str) -> Result<Self> {
        let mut archive = zip::ZipArchive::new(reader)
            .map_err(|e| DeltavoxError::parse(context, format!("not an npz archive: {e}")))?;
        let a = read_entry(&mut archive, FACTOR_A, context)?;
        let b = read_entry(&mut archive, FACTOR_B, context)?;
        Self::from_factors(a, b)
    }

    /// Assemble from decoded factors
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::DimensionMismatch`] if `A`'s rank differs
    /// from `B`'s or the rank is zero.
    pub fn from_factors(a: NpyArray, b: NpyArray) -> Result<Self> {
        let [vocab_size, rank] = a.shape;
        let [b_rank, hidden_dim] = b.shape;
        if rank != b_rank {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!("rank mismatch: A has rank {rank}, B has {b_rank}"),
            });
        }
        if rank == 0 || vocab_size == 0 || hidden_dim == 0 {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!("empty factor: A {:?}, B {:?}", a.shape, b.shape),
            });
        }
        Ok(Self {
            vocab_size,
            hidden_dim,
            rank,
            a: a.data,
            b: b.data,
            scratch: vec![0.0; rank],
        })
    }

    /// Check the factors against the model's vocabulary and hidden width
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::DimensionMismatch`] naming the disagreeing
    /// dimension.
    pub fn validate(&self, vocab_size: usize, hidden_dim: usize) -> Result<()> {
        if self.vocab_size != vocab_size {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!(
                    "delta vocabulary {} does not match model vocabulary {vocab_size}",
                    self.vocab_size
                ),
            });
        }
        if self.hidden_dim != hidden_dim {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!(
                    "delta hidden width {} does not match model hidden width {hidden_dim}",
                    self.hidden_dim
                ),
            });
        }
        Ok(())
    }

    /// Rows of `A`
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Columns of `B`
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Shared inner dimension
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// `logits += alpha · A · (B · hidden)`
    ///
    /// A zero `alpha` returns immediately and leaves `logits` unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::DimensionMismatch`] if `logits` or `hidden`
    /// have the wrong length.
    pub fn apply_to_logits(
        &mut self,
        logits: &mut [f32],
        hidden: &[f32],
        alpha: f32,
    ) -> Result<()> {
        if alpha == 0.0 {
            return Ok(());
        }
        if logits.len() != self.vocab_size {
            return Err(DeltavoxError::DimensionMismatch {
                reason: format!(
                    "logits length {} does not match delta vocabulary {}",
                    logits.len(),
                    self.vocab_size
                ),
            });
        }

        matvec_f32_into(&self.b, hidden, self.hidden_dim, &mut self.scratch)?;

        let (a, bx, rank) = (&self.a, &self.scratch, self.rank);
        par_rows(logits, |row, slot| {
            *slot += alpha * dot(&a[row * rank..(row + 1) * rank], bx);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn array(rows: usize, cols: usize, values: Vec<f32>) -> NpyArray {
        NpyArray {
            shape: [rows, cols],
            data: values,
        }
    }

    fn npz(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_apply_matches_dense_product() {
        // A = [[1, 0], [0, 1], [1, 1]], B = [[1, 2], [3, 4]]
        let mut voice = DeltaVoice::from_factors(
            array(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
            array(2, 2, vec![1.0, 2.0, 3.0, 4.0]),
        )
        .unwrap();
        let mut logits = vec![10.0, 20.0, 30.0];
        voice.apply_to_logits(&mut logits, &[1.0, 1.0], 0.5).unwrap();
        // B·h = [3, 7]; A·(B·h) = [3, 7, 10]
        assert_eq!(logits, vec![11.5, 23.5, 35.0]);
    }

    #[test]
    fn test_zero_alpha_is_identity() {
        let mut voice = DeltaVoice::from_factors(
            array(2, 1, vec![f32::NAN, 1.0]),
            array(1, 2, vec![1.0, 1.0]),
        )
        .unwrap();
        let original = vec![0.1f32, -0.3];
        let mut logits = original.clone();
        voice.apply_to_logits(&mut logits, &[1.0, 2.0], 0.0).unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&logits), bits(&original));
    }

    #[test]
    fn test_rank_mismatch() {
        let err = DeltaVoice::from_factors(array(4, 2, vec![0.0; 8]), array(3, 5, vec![0.0; 15]))
            .unwrap_err();
        assert!(matches!(err, DeltavoxError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_validate_against_model() {
        let voice =
            DeltaVoice::from_factors(array(4, 2, vec![0.0; 8]), array(2, 3, vec![0.0; 6])).unwrap();
        assert!(voice.validate(4, 3).is_ok());
        assert!(matches!(
            voice.validate(5, 3),
            Err(DeltavoxError::DimensionMismatch { .. })
        ));
        assert!(voice.validate(4, 8).is_err());
    }

    #[test]
    fn test_from_npz_mixed_precision() {
        let a = write_npy(&[1.0, 2.0, 3.0, 4.0], [2, 2], NpyDtype::F16);
        let b = write_npy(&[0.5, 0.5, 0.5, 0.5, 0.5, 0.5], [2, 3], NpyDtype::F32);
        let rank = write_npy(&[2.0], [1, 1], NpyDtype::F32);
        let bytes = npz(&[("rank.npy", rank), ("A.npy", a), ("B.npy", b)]);

        let voice = DeltaVoice::from_reader(Cursor::new(bytes), "test.npz").unwrap();
        assert_eq!((voice.vocab_size(), voice.rank(), voice.hidden_dim()), (2, 2, 3));
    }

    #[test]
    fn test_missing_entry_and_bad_archive() {
        let a = write_npy(&[1.0; 4], [2, 2], NpyDtype::F32);
        let only_a = npz(&[("A.npy", a)]);
        assert!(matches!(
            DeltaVoice::from_reader(Cursor::new(only_a), "x"),
            Err(DeltavoxError::Parse { .. })
        ));
        assert!(DeltaVoice::from_reader(Cursor::new(b"not a zip".to_vec()), "x").is_err());
    }

    #[test]
    fn test_load_missing_file_is_io() {
        let err = DeltaVoice::load("/nonexistent/delta.npz").unwrap_err();
        assert!(matches!(err, DeltavoxError::Io { .. }));
    }
}
