//! Fixed 64-byte tree keys, ordered by memcmp.
//!
//! Shorter byte keys are zero-extended. Integer and float helpers encode
//! big-endian with the sign flipped so lexicographic order equals numeric
//! order.

use std::fmt;

use crate::error::{DbError, Result};

pub const KEY_SIZE: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub const MIN: Key = Key([0u8; KEY_SIZE]);

    /// Zero-pad `bytes` into a key. Fails when the input is longer than the
    /// fixed key size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > KEY_SIZE {
            return Err(DbError::InvalidArgument(format!(
                "key of {} bytes exceeds the {}-byte limit",
                bytes.len(),
                KEY_SIZE
            )));
        }
        let mut buf = [0u8; KEY_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Encode a signed integer so memcmp order equals numeric order.
    pub fn from_i64(v: i64) -> Self {
        let flipped = (v as u64) ^ (1u64 << 63);
        let mut buf = [0u8; KEY_SIZE];
        buf[..8].copy_from_slice(&flipped.to_be_bytes());
        Self(buf)
    }

    /// Encode a double so memcmp order equals numeric order. Negative
    /// values have all bits flipped, positive values only the sign bit.
    pub fn from_f64(v: f64) -> Self {
        let bits = v.to_bits();
        let flipped = if bits & (1u64 << 63) != 0 {
            !bits
        } else {
            bits ^ (1u64 << 63)
        };
        let mut buf = [0u8; KEY_SIZE];
        buf[..8].copy_from_slice(&flipped.to_be_bytes());
        Self(buf)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub(crate) fn read_from(buf: &[u8]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&buf[..KEY_SIZE]);
        Self(key)
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        buf[..KEY_SIZE].copy_from_slice(&self.0);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // print the printable prefix, then the tail length
        let printable: usize = self
            .0
            .iter()
            .take_while(|b| b.is_ascii_graphic() || **b == b' ')
            .count();
        let tail = self.0[printable..].iter().filter(|b| **b != 0).count();
        write!(
            f,
            "Key({:?}{})",
            String::from_utf8_lossy(&self.0[..printable]),
            if tail > 0 { "+bin" } else { "" }
        )
    }
}
