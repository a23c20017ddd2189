//! Core data types for ICS datasets

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::MAX_IMEL_SIZE;

/// Sample types supported by ICS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 0,
    /// Signed 8-bit integer
    S8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Signed 16-bit integer
    S16 = 3,
    /// Unsigned 32-bit integer
    U32 = 4,
    /// Signed 32-bit integer
    S32 = 5,
    /// 32-bit floating point
    F32 = 6,
    /// 64-bit floating point
    F64 = 7,
    /// Complex pair of 32-bit floats
    C32 = 8,
    /// Complex pair of 64-bit floats
    C64 = 9,
    /// Not set / not recognized
    Unknown = 10,
}

impl DataType {
    /// Size in bytes of one imel of this type. Zero for `Unknown`.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::S8 => 1,
            DataType::U16 | DataType::S16 => 2,
            DataType::U32 | DataType::S32 | DataType::F32 => 4,
            DataType::F64 | DataType::C32 => 8,
            DataType::C64 => 16,
            DataType::Unknown => 0,
        }
    }

    /// Width of one storage unit as seen by the byte-order engine.
    ///
    /// Complex samples are stored as two interleaved components, so their
    /// bytes are reordered per component, not per imel.
    pub fn sample_width(&self) -> usize {
        match self {
            DataType::C32 => 4,
            DataType::C64 => 8,
            _ => self.size_in_bytes(),
        }
    }

    /// Check if this is a floating point type (including complex)
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DataType::F32 | DataType::F64 | DataType::C32 | DataType::C64
        )
    }

    /// Check if this is a complex type
    pub fn is_complex(&self) -> bool {
        matches!(self, DataType::C32 | DataType::C64)
    }

    /// Check if this is a signed type
    pub fn is_signed(&self) -> bool {
        !matches!(self, DataType::U8 | DataType::U16 | DataType::U32)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Byte order of a multi-byte sample on disk.
///
/// A permutation of `1..=width` padded with zeros to [`MAX_IMEL_SIZE`]
/// entries. Entry `i` names which source byte (1-based) supplies byte `i` of
/// the stored sample. An all-zero prefix means the order was never declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteOrder(pub(crate) [u8; MAX_IMEL_SIZE]);

impl ByteOrder {
    /// The machine's own byte order for samples of `width` bytes.
    pub fn native(width: usize) -> Self {
        let width = width.min(MAX_IMEL_SIZE);
        let mut order = [0u8; MAX_IMEL_SIZE];
        if crate::utils::little_endian_host() {
            for (i, entry) in order.iter_mut().enumerate().take(width) {
                *entry = (i + 1) as u8;
            }
        } else {
            for (i, entry) in order.iter_mut().enumerate().take(width) {
                *entry = (width - i) as u8;
            }
        }
        ByteOrder(order)
    }

    /// An undeclared byte order (all zeros). The byte-order engine treats
    /// this as "leave the bytes alone".
    pub fn unspecified() -> Self {
        ByteOrder([0u8; MAX_IMEL_SIZE])
    }

    /// Build from 1-based permutation entries, e.g. `[2, 1]` for a
    /// byte-swapped 16-bit sample. Entries beyond `MAX_IMEL_SIZE` are
    /// dropped.
    pub fn from_entries(entries: &[usize]) -> Self {
        let mut order = [0u8; MAX_IMEL_SIZE];
        for (i, &e) in entries.iter().enumerate().take(MAX_IMEL_SIZE) {
            order[i] = e as u8;
        }
        ByteOrder(order)
    }

    /// The first `width` entries of the permutation.
    pub fn entries(&self, width: usize) -> &[u8] {
        &self.0[..width.min(MAX_IMEL_SIZE)]
    }

    /// True when any entry within `width` is zero.
    pub fn is_unspecified(&self, width: usize) -> bool {
        self.0[..width.min(MAX_IMEL_SIZE)].iter().any(|&e| e == 0)
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::unspecified()
    }
}
