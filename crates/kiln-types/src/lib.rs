//! Shared leaf types for the kiln serving core.
//!
//! Everything here is pure data and arithmetic: tensor datatypes, shape
//! comparison under wildcard dimensions, batch byte-size computation, and
//! memory kinds. The heavier lifecycle and scheduling machinery lives in
//! `kiln-core`; this crate stays dependency-light so backend implementations
//! can use it without pulling in the runtime.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `-1` in a configured dimension list stands for "any size".
pub const WILDCARD_DIM: i64 = -1;

// ─── Datatypes ────────────────────────────────────────────────────────────────

/// Tensor element datatype.
///
/// All variants except [`DataType::Bytes`] have a fixed element size.
/// `Bytes` elements are variable-size byte strings with a 4-byte
/// little-endian length prefix (see [`pack_byte_strings`]).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
pub enum DataType {
    #[serde(rename = "TYPE_BOOL")]
    #[strum(serialize = "TYPE_BOOL")]
    Bool,
    #[serde(rename = "TYPE_UINT8")]
    #[strum(serialize = "TYPE_UINT8")]
    Uint8,
    #[serde(rename = "TYPE_UINT16")]
    #[strum(serialize = "TYPE_UINT16")]
    Uint16,
    #[serde(rename = "TYPE_UINT32")]
    #[strum(serialize = "TYPE_UINT32")]
    Uint32,
    #[serde(rename = "TYPE_UINT64")]
    #[strum(serialize = "TYPE_UINT64")]
    Uint64,
    #[serde(rename = "TYPE_INT8")]
    #[strum(serialize = "TYPE_INT8")]
    Int8,
    #[serde(rename = "TYPE_INT16")]
    #[strum(serialize = "TYPE_INT16")]
    Int16,
    #[serde(rename = "TYPE_INT32")]
    #[strum(serialize = "TYPE_INT32")]
    Int32,
    #[serde(rename = "TYPE_INT64")]
    #[strum(serialize = "TYPE_INT64")]
    Int64,
    #[serde(rename = "TYPE_FP16")]
    #[strum(serialize = "TYPE_FP16")]
    Fp16,
    #[serde(rename = "TYPE_FP32")]
    #[strum(serialize = "TYPE_FP32")]
    Fp32,
    #[serde(rename = "TYPE_FP64")]
    #[strum(serialize = "TYPE_FP64")]
    Fp64,
    /// Variable-size byte string; element byte size is caller-supplied.
    #[serde(rename = "TYPE_STRING")]
    #[strum(serialize = "TYPE_STRING")]
    Bytes,
}

impl DataType {
    /// Fixed element size in bytes, or `None` for variable-size strings.
    pub fn size_of(self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Uint8 | DataType::Int8 => Some(1),
            DataType::Uint16 | DataType::Int16 | DataType::Fp16 => Some(2),
            DataType::Uint32 | DataType::Int32 | DataType::Fp32 => Some(4),
            DataType::Uint64 | DataType::Int64 | DataType::Fp64 => Some(8),
            DataType::Bytes => None,
        }
    }

    /// `true` for datatypes whose byte size cannot be derived from a shape.
    pub fn is_variable_size(self) -> bool {
        self.size_of().is_none()
    }
}

// ─── Memory kinds ─────────────────────────────────────────────────────────────

/// Where a buffer lives.
///
/// Allocators may downgrade `Pinned` to `Pageable` on pool exhaustion; the
/// *actual* kind is always recorded next to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum MemoryType {
    /// Page-locked host memory from the shared pinned pool.
    Pinned,
    /// Ordinary pageable host memory.
    Pageable,
    /// Device memory, keyed by device index.
    Device(u32),
}

impl MemoryType {
    /// Device index for device memory, `None` for host kinds.
    pub fn device_id(self) -> Option<u32> {
        match self {
            MemoryType::Device(id) => Some(id),
            _ => None,
        }
    }
}

// ─── Shape arithmetic ─────────────────────────────────────────────────────────

/// Errors from shape and reshape arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    /// The resolved shape does not match the configured dims under wildcards.
    #[error("shape {shape:?} does not match configured dims {dims:?}")]
    Mismatch { dims: Vec<i64>, shape: Vec<i64> },

    /// Wildcard counts of `dims` and `reshape` differ.
    #[error(
        "reshape {reshape:?} has {reshape_wildcards} wildcard(s) but dims {dims:?} has {dims_wildcards}"
    )]
    WildcardArity {
        dims: Vec<i64>,
        reshape: Vec<i64>,
        dims_wildcards: usize,
        reshape_wildcards: usize,
    },

    /// A dimension that should be concrete is still negative.
    #[error("dimension {dim} at index {index} is not a concrete size")]
    Unresolved { dim: i64, index: usize },

    /// A byte-string buffer ends mid-element.
    #[error("byte-string buffer truncated at offset {offset}")]
    Truncated { offset: usize },
}

/// Element-wise shape check under wildcard rules: each configured dim must
/// equal the resolved dim or be [`WILDCARD_DIM`].
pub fn compare_dims_with_wildcard(dims: &[i64], shape: &[i64]) -> bool {
    dims.len() == shape.len()
        && dims
            .iter()
            .zip(shape)
            .all(|(&d, &s)| d == WILDCARD_DIM || d == s)
}

/// Number of elements in a fully resolved shape.
///
/// Returns `None` if any dimension is still a wildcard or otherwise negative.
pub fn element_count(shape: &[i64]) -> Option<u64> {
    shape.iter().try_fold(1u64, |acc, &d| {
        if d < 0 {
            None
        } else {
            acc.checked_mul(d as u64)
        }
    })
}

/// Byte size of one batched tensor.
///
/// `shape` is the per-item working shape (batch dimension already stripped
/// when the model batches). Shape tensors are never replicated per batch
/// item, so the batch multiplier does not apply to them. Returns `None` for
/// variable-size datatypes, whose byte size is caller-supplied.
pub fn batch_byte_size(
    data_type: DataType,
    shape: &[i64],
    batch_size: u32,
    is_shape_tensor: bool,
) -> Option<u64> {
    let elem = data_type.size_of()? as u64;
    let count = element_count(shape)?;
    let multiplier = if is_shape_tensor { 1 } else { batch_size as u64 };
    elem.checked_mul(count)?.checked_mul(multiplier)
}

/// Apply a configured reshape to a resolved shape.
///
/// Values captured at the wildcard positions of `dims` (from `resolved`) are
/// placed, in order, into the wildcard slots of `reshape`. Both lists must
/// carry the same number of wildcards; the configuration validator enforces
/// this before a model loads, so hitting [`ShapeError::WildcardArity`] here
/// means the shape came from an unvalidated source.
pub fn resolve_reshape(
    dims: &[i64],
    reshape: &[i64],
    resolved: &[i64],
) -> Result<Vec<i64>, ShapeError> {
    if !compare_dims_with_wildcard(dims, resolved) {
        return Err(ShapeError::Mismatch {
            dims: dims.to_vec(),
            shape: resolved.to_vec(),
        });
    }

    let captured: Vec<i64> = dims
        .iter()
        .zip(resolved)
        .filter(|&(&d, _)| d == WILDCARD_DIM)
        .map(|(_, &s)| s)
        .collect();
    let slots = reshape.iter().filter(|&&d| d == WILDCARD_DIM).count();
    if slots != captured.len() {
        return Err(ShapeError::WildcardArity {
            dims: dims.to_vec(),
            reshape: reshape.to_vec(),
            dims_wildcards: captured.len(),
            reshape_wildcards: slots,
        });
    }

    let mut next = captured.into_iter();
    let out: Vec<i64> = reshape
        .iter()
        .map(|&d| {
            if d == WILDCARD_DIM {
                next.next().unwrap_or(WILDCARD_DIM)
            } else {
                d
            }
        })
        .collect();

    if let Some((index, &dim)) = out.iter().enumerate().find(|&(_, &d)| d < 0) {
        return Err(ShapeError::Unresolved { dim, index });
    }
    Ok(out)
}

// ─── Byte-string packing ──────────────────────────────────────────────────────

/// Serialize byte-string elements into the wire layout: each element is a
/// 4-byte little-endian length followed by the raw bytes.
pub fn pack_byte_strings<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let total: usize = items.iter().map(|i| 4 + i.as_ref().len()).sum();
    let mut out = Vec::with_capacity(total);
    for item in items {
        let bytes = item.as_ref();
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

/// Inverse of [`pack_byte_strings`].
///
/// Returns [`ShapeError::Unresolved`] when the buffer is truncated mid-element.
pub fn unpack_byte_strings(buf: &[u8]) -> Result<Vec<Vec<u8>>, ShapeError> {
    let mut items = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        let header = buf
            .get(offset..offset + 4)
            .ok_or(ShapeError::Truncated { offset })?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        offset += 4;
        let body = buf
            .get(offset..offset + len)
            .ok_or(ShapeError::Truncated { offset })?;
        items.push(body.to_vec());
        offset += len;
    }
    Ok(items)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
