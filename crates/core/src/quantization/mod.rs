//! Quantizer dispatch: byte encodings for float vectors and the distance
//! kernels that operate on them.
//!
//! Each [`QuantLevel`] fixes the storage footprint of a vector and a triplet
//! of distance kernels (L2, inner product, cosine) plus matching similarity
//! kernels. A [`QuantizerDispatch`] is a capability table built once per
//! level; the space captures the concrete function pointers so inner loops
//! never branch on the level.
//!
//! Kernels are written as SIMD-friendly chunked loops the auto-vectorizer
//! handles well; the scalar arithmetic is the reference that any specialized
//! build must match in ranking order.

/// SIMD-friendly f32 kernels for the exact (unquantized) level.
pub mod float;
/// Scalar int8 quantization with per-vector min/scale calibration.
pub mod int8;

use crate::error::{Error, Result};

/// Byte encoding applied to dense vectors before they reach the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantLevel {
    /// One byte per component, per-vector min/scale appended to the payload.
    Int8,
    /// Raw little-endian f32 components. Exact, four bytes per component.
    F32,
}

impl QuantLevel {
    /// Stable numeric tag used in index metadata.
    pub fn as_u8(self) -> u8 {
        match self {
            QuantLevel::Int8 => 8,
            QuantLevel::F32 => 32,
        }
    }

    /// Parse the numeric tag back into a level.
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            8 => Ok(QuantLevel::Int8),
            32 => Ok(QuantLevel::F32),
            other => Err(Error::InvalidArgument(format!(
                "unknown quantization level tag {other}"
            ))),
        }
    }

    /// Bytes needed to store one vector of `dim` components at this level.
    pub fn storage_size(self, dim: usize) -> usize {
        match self {
            // dim codes + f32 min + f32 scale
            QuantLevel::Int8 => dim + 8,
            QuantLevel::F32 => dim * 4,
        }
    }
}

/// Parameter block handed to every distance kernel.
///
/// Kernels read only the dimension and the level; per-vector calibration
/// parameters travel inside the encoded payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistParams {
    pub dim: usize,
    pub level: QuantLevel,
}

/// Distance or similarity kernel over two encoded vectors.
pub type DistFn = fn(&[u8], &[u8], &DistParams) -> f32;

/// Capability table for one quantization level: encode function plus the
/// kernel for every metric. Built once, then captured by the space.
#[derive(Debug, Clone, Copy)]
pub struct QuantizerDispatch {
    pub level: QuantLevel,
    pub dist_l2: DistFn,
    pub dist_ip: DistFn,
    pub dist_cosine: DistFn,
    pub sim_l2: DistFn,
    pub sim_ip: DistFn,
    pub sim_cosine: DistFn,
}

impl QuantizerDispatch {
    /// Select the kernel set for a level.
    pub fn for_level(level: QuantLevel) -> Self {
        match level {
            QuantLevel::Int8 => Self {
                level,
                dist_l2: int8::dist_l2,
                dist_ip: int8::dist_ip,
                dist_cosine: int8::dist_cosine,
                sim_l2: int8::sim_l2,
                sim_ip: int8::sim_ip,
                sim_cosine: int8::sim_cosine,
            },
            QuantLevel::F32 => Self {
                level,
                dist_l2: float::dist_l2,
                dist_ip: float::dist_ip,
                dist_cosine: float::dist_cosine,
                sim_l2: float::sim_l2,
                sim_ip: float::sim_ip,
                sim_cosine: float::sim_cosine,
            },
        }
    }
}

/// Encode a float vector at the given level. Pure and deterministic.
pub fn quantize(level: QuantLevel, vector: &[f32]) -> Vec<u8> {
    match level {
        QuantLevel::Int8 => int8::quantize(vector),
        QuantLevel::F32 => float::encode(vector),
    }
}
