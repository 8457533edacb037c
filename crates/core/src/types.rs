//! Internal ID width configuration and shared aliases.
//!
//! The `wide-ids` cargo feature switches internal IDs from `u32` to `u64`
//! and the bitmap type from `roaring::RoaringBitmap` to
//! `roaring::RoaringTreemap`. 32-bit IDs are the default: they halve the
//! footprint of postings, buckets, and ID mappings.

use crate::error::{Error, Result};

/// Internal document ID minted by the ID mapper. Dense, recyclable.
#[cfg(not(feature = "wide-ids"))]
pub type IntId = u32;

/// Internal document ID minted by the ID mapper. Dense, recyclable.
#[cfg(feature = "wide-ids")]
pub type IntId = u64;

/// Roaring bitmap over internal IDs.
#[cfg(not(feature = "wide-ids"))]
pub type Bitmap = roaring::RoaringBitmap;

/// Roaring bitmap over internal IDs.
#[cfg(feature = "wide-ids")]
pub type Bitmap = roaring::RoaringTreemap;

/// Serialized width of an [`IntId`] in every on-disk layout.
pub const ID_BYTES: usize = std::mem::size_of::<IntId>();

/// Sentinel for an exhausted posting iterator. Never a valid document ID
/// (the mapper mints IDs starting from 1 and the counter cannot wrap).
pub(crate) const EXHAUSTED: IntId = IntId::MAX;

/// Encode an ID in the little-endian layout shared by all wire formats.
#[inline]
pub(crate) fn encode_id(id: IntId) -> [u8; ID_BYTES] {
    id.to_le_bytes()
}

/// Decode a little-endian ID from the front of `buf`.
#[inline]
pub(crate) fn decode_id(buf: &[u8]) -> Result<IntId> {
    if buf.len() < ID_BYTES {
        return Err(Error::Corruption(format!(
            "id field truncated: {} bytes, need {}",
            buf.len(),
            ID_BYTES
        )));
    }
    let mut raw = [0u8; ID_BYTES];
    raw.copy_from_slice(&buf[..ID_BYTES]);
    Ok(IntId::from_le_bytes(raw))
}
