//! Fixed-length bit array used for received-block and missing-chunk tracking.

use serde::{Deserialize, Serialize};

/// Bit array, least significant bit of byte 0 is index 0.
///
/// Decoding rejects a byte buffer that does not match `len`, or that has
/// bits set past `len`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "RawBitfield")]
pub struct Bitfield {
    len: u32,
    bytes: Vec<u8>,
}

#[derive(Deserialize)]
struct RawBitfield {
    len: u32,
    bytes: Vec<u8>,
}

impl TryFrom<RawBitfield> for Bitfield {
    type Error = String;

    fn try_from(raw: RawBitfield) -> Result<Self, Self::Error> {
        let expected = raw.len.div_ceil(8) as usize;
        if raw.bytes.len() != expected {
            return Err(format!(
                "bitfield of {} bits needs {} bytes, got {}",
                raw.len,
                expected,
                raw.bytes.len()
            ));
        }
        let tail = raw.len % 8;
        if tail != 0 && raw.bytes.last().is_some_and(|b| b >> tail != 0) {
            return Err(format!("bits set past the end of a {}-bit field", raw.len));
        }
        Ok(Self {
            len: raw.len,
            bytes: raw.bytes,
        })
    }
}

impl Bitfield {
    pub fn new(len: u32) -> Self {
        Self {
            len,
            bytes: vec![0u8; len.div_ceil(8) as usize],
        }
    }

    /// Bitfield with every bit set.
    pub fn full(len: u32) -> Self {
        let mut field = Self::new(len);
        field.set_all();
        field
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.bytes
            .get((index / 8) as usize)
            .is_some_and(|b| b & (1 << (index % 8)) != 0)
    }

    /// Set bit `index`. Returns false if it was already set or out of range.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len || self.get(index) {
            return false;
        }
        self.bytes[(index / 8) as usize] |= 1 << (index % 8);
        true
    }

    pub fn clear(&mut self, index: u32) {
        if index < self.len {
            self.bytes[(index / 8) as usize] &= !(1 << (index % 8));
        }
    }

    pub fn set_all(&mut self) {
        for i in 0..self.len {
            self.set(i);
        }
    }

    pub fn clear_all(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    pub fn count(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    pub fn none_set(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Indices of set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |i| self.get(*i))
    }

    /// Indices of clear bits, ascending.
    pub fn iter_clear(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |i| !self.get(*i))
    }

    pub fn first_clear(&self) -> Option<u32> {
        self.iter_clear().next()
    }
}
