//! Sparse vector representation and its packed wire format.
//!
//! A sparse vector is a strictly-ascending list of `(term_id, value)` pairs.
//! The packed layout is little-endian throughout:
//! `u16 nnz ‖ u32[nnz] term_ids ‖ f16[nnz] values`, with values in IEEE-754
//! binary16 (subnormals allowed, Inf/NaN preserved bit-exactly).

use byteorder::{LittleEndian, ReadBytesExt};
use half::f16;

use crate::error::{Error, Result};

/// Sorted-by-term sparse vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    /// Build from parallel arrays, enforcing equal lengths and strictly
    /// ascending indices.
    pub fn new(indices: Vec<u32>, values: Vec<f32>) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(Error::InvalidArgument(format!(
                "sparse vector has {} indices but {} values",
                indices.len(),
                values.len()
            )));
        }
        if indices.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidArgument(
                "sparse vector indices must be strictly ascending".into(),
            ));
        }
        Ok(Self { indices, values })
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn clear(&mut self) {
        self.indices.clear();
        self.values.clear();
    }

    /// Pack into the wire format. Fails when the vector holds more than
    /// `u16::MAX` terms.
    pub fn pack(&self) -> Result<Vec<u8>> {
        if self.indices.len() != self.values.len() {
            return Err(Error::Internal(
                "sparse vector indices/values length mismatch".into(),
            ));
        }
        let nnz = u16::try_from(self.indices.len()).map_err(|_| {
            Error::InvalidArgument(format!(
                "sparse vector has {} terms, limit is {}",
                self.indices.len(),
                u16::MAX
            ))
        })?;

        let mut packed = Vec::with_capacity(2 + self.indices.len() * 6);
        packed.extend_from_slice(&nnz.to_le_bytes());
        for &term in &self.indices {
            packed.extend_from_slice(&term.to_le_bytes());
        }
        for &value in &self.values {
            packed.extend_from_slice(&f16::from_f32(value).to_bits().to_le_bytes());
        }
        Ok(packed)
    }

    /// Unpack from the wire format, validating the declared size and the
    /// index ordering.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut reader = data;
        let nnz = reader
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::InvalidArgument("packed sparse vector shorter than nnz".into()))?
            as usize;

        let expected = 2 + nnz * 6;
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "packed sparse vector is {} bytes, expected {expected} for nnz={nnz}",
                data.len()
            )));
        }

        let mut indices = Vec::with_capacity(nnz);
        for _ in 0..nnz {
            indices.push(
                reader
                    .read_u32::<LittleEndian>()
                    .map_err(|_| Error::InvalidArgument("truncated term id array".into()))?,
            );
        }
        let mut values = Vec::with_capacity(nnz);
        for _ in 0..nnz {
            let bits = reader
                .read_u16::<LittleEndian>()
                .map_err(|_| Error::InvalidArgument("truncated value array".into()))?;
            values.push(f16::from_bits(bits).to_f32());
        }
        Self::new(indices, values)
    }

    /// Dot product of two sparse vectors by two-pointer intersection.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let mut result = 0.0f32;
        let mut i = 0;
        let mut j = 0;
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Equal => {
                    result += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
            }
        }
        result
    }

    /// Dot product against a packed vector without unpacking it. Damaged
    /// input contributes nothing, mirroring a zero vector.
    pub fn dot_packed(&self, packed: &[u8]) -> f32 {
        if packed.len() < 2 || self.indices.is_empty() {
            return 0.0;
        }
        let nnz = u16::from_le_bytes([packed[0], packed[1]]) as usize;
        if packed.len() != 2 + nnz * 6 {
            return 0.0;
        }
        let terms = &packed[2..2 + nnz * 4];
        let values = &packed[2 + nnz * 4..];

        let mut result = 0.0f32;
        let mut i = 0;
        let mut j = 0;
        while i < self.indices.len() && j < nnz {
            let at = j * 4;
            let other_term =
                u32::from_le_bytes([terms[at], terms[at + 1], terms[at + 2], terms[at + 3]]);
            match self.indices[i].cmp(&other_term) {
                std::cmp::Ordering::Equal => {
                    let bits = u16::from_le_bytes([values[j * 2], values[j * 2 + 1]]);
                    result += self.values[i] * f16::from_bits(bits).to_f32();
                    i += 1;
                    j += 1;
                }
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
            }
        }
        result
    }
}
