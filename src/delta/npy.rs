//! Minimal NumPy `.npy` reader and writer for 2-D float arrays
//!
//! Layout: `\x93NUMPY`, major/minor version, header length (u16 for v1,
//! u32 for v2/v3), a Python dict literal header, then raw C-order data.
//! Only little-endian `<f2` and `<f4` element types are accepted.

use crate::error::{DeltavoxError, Result};
use crate::quantize::f16_to_f32;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDtype {
    /// `<f2`
    F16,
    /// `<f4`
    F32,
}

impl NpyDtype {
    fn descr(self) -> &'static str {
        match self {
            Self::F16 => "<f2",
            Self::F32 => "<f4",
        }
    }

    fn size(self) -> usize {
        match self {
            Self::F16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Decoded 2-D array, widened to f32
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    /// `[rows, cols]`
    pub shape: [usize; 2],
    /// Row-major values
    pub data: Vec<f32>,
}

/// Value of `key` in the header dict, up to the next top-level comma
fn header_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{key}':");
    let start = header.find(&pattern)? + pattern.len();
    let rest = header[start..].trim_start();
    if rest.starts_with('(') {
        let end = rest.find(')')?;
        Some(&rest[..=end])
    } else {
        let end = rest.find([',', '}']).unwrap_or(rest.len());
        Some(rest[..end].trim())
    }
}

fn parse_header(header: &str, context: &str) -> Result<(NpyDtype, [usize; 2])> {
    let descr = header_field(header, "descr")
        .ok_or_else(|| DeltavoxError::parse(context, "header has no descr"))?
        .trim_matches(|c| c == '\'' || c == '"');
    let dtype = match descr {
        "<f2" => NpyDtype::F16,
        "<f4" => NpyDtype::F32,
        other => {
            return Err(DeltavoxError::UnsupportedFormat {
                what: format!("{context}: element type {other}"),
            })
        },
    };

    if header_field(header, "fortran_order") == Some("True") {
        return Err(DeltavoxError::UnsupportedFormat {
            what: format!("{context}: Fortran-ordered array"),
        });
    }

    let shape_text = header_field(header, "shape")
        .ok_or_else(|| DeltavoxError::parse(context, "header has no shape"))?;
    let dims: Vec<usize> = shape_text
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| DeltavoxError::parse(context, format!("bad shape entry {s:?}")))
        })
        .collect::<Result<_>>()?;
    let &[rows, cols] = dims.as_slice() else {
        return Err(DeltavoxError::DimensionMismatch {
            reason: format!("{context}: expected a 2-D array, shape is {shape_text}"),
        });
    };
    Ok((dtype, [rows, cols]))
}

/// Parse an `.npy` file held in memory
///
/// # Errors
///
/// Returns [`DeltavoxError::Parse`] for a bad magic, header or truncated
/// data, and [`DeltavoxError::UnsupportedFormat`] for element types other
/// than little-endian f16/f32.
pub fn read_npy(bytes: &[u8], context: &str) -> Result<NpyArray> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(DeltavoxError::parse(context, "not a .npy file"));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (usize::from(u16::from_le_bytes([bytes[8], bytes[9]])), 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(DeltavoxError::parse(context, "truncated header length"));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        },
        v => return Err(DeltavoxError::parse(context, format!("unsupported version {v}"))),
    };
    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .ok_or_else(|| DeltavoxError::parse(context, "truncated header"))?;
    let header = std::str::from_utf8(header)
        .map_err(|_| DeltavoxError::parse(context, "header is not text"))?;

    let (dtype, shape) = parse_header(header, context)?;
    let elements = shape[0]
        .checked_mul(shape[1])
        .ok_or_else(|| DeltavoxError::parse(context, "shape overflows"))?;
    let payload = &bytes[data_start..];
    let needed = elements
        .checked_mul(dtype.size())
        .ok_or_else(|| DeltavoxError::parse(context, "shape overflows"))?;
    if payload.len() < needed {
        return Err(DeltavoxError::parse(
            context,
            format!("data has {} bytes, shape needs {needed}", payload.len()),
        ));
    }

    let data = match dtype {
        NpyDtype::F16 => payload[..needed]
            .chunks_exact(2)
            .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        NpyDtype::F32 => payload[..needed]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    };
    Ok(NpyArray { shape, data })
}

/// Serialize a 2-D array as version 1.0 `.npy`
///
/// Used to produce delta archives for tests and tooling.
#[must_use]
pub fn write_npy(values: &[f32], shape: [usize; 2], dtype: NpyDtype) -> Vec<u8> {
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({}, {}), }}",
        dtype.descr(),
        shape[0],
        shape[1]
    );
    // magic + version + length + header + newline is padded to 64 bytes
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat(unpadded.next_multiple_of(64) - unpadded));
    header.push('\n');

    let mut out = Vec::with_capacity(10 + header.len() + values.len() * dtype.size());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for &v in values {
        match dtype {
            NpyDtype::F16 => out.extend_from_slice(&half::f16::from_f32(v).to_le_bytes()),
            NpyDtype::F32 => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
    out
}
