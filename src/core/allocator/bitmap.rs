//! Bitmap over a contiguous address range
//!
//! Each bit tracks one absolute address in `offset..size`:
//! - 0 = free
//! - 1 = taken (cached by the allocator or owned by a chain)
//!
//! Bits are packed LSB-first into bytes.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMap {
    /// One past the last tracked address
    size: u64,

    /// First tracked address
    offset: u64,

    /// Packed bits, `ceil((size - offset) / 8)` bytes
    bitmap: Vec<u8>,
}

impl AddressMap {
    /// Create a map with every address free
    ///
    /// `size` must be greater than `offset`.
    pub fn new(size: u64, offset: u64) -> Result<Self> {
        if size <= offset {
            return Err(VaultError::Config(format!(
                "address map size {} must exceed offset {}",
                size, offset
            )));
        }
        let bits = size - offset;
        let num_bytes = ((bits + 7) / 8) as usize;
        Ok(AddressMap {
            size,
            offset,
            bitmap: vec![0u8; num_bytes],
        })
    }

    /// Rebuild a map from persisted bytes
    pub fn from_parts(size: u64, offset: u64, bitmap: Vec<u8>) -> Result<Self> {
        let map = AddressMap::new(size, offset)?;
        if bitmap.len() != map.bitmap.len() {
            return Err(VaultError::BitmapFormat(format!(
                "expected {} bitmap bytes, found {}",
                map.bitmap.len(),
                bitmap.len()
            )));
        }
        Ok(AddressMap { bitmap, ..map })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of tracked addresses
    pub fn capacity(&self) -> u64 {
        self.size - self.offset
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.offset && address < self.size
    }

    fn position(&self, address: u64) -> Result<(usize, u8)> {
        if !self.contains(address) {
            return Err(VaultError::AddressOutOfRange {
                address,
                size: self.size,
                offset: self.offset,
            });
        }
        let bit = address - self.offset;
        Ok(((bit / 8) as usize, (bit % 8) as u8))
    }

    /// Whether `address` is cached or allocated
    pub fn is_taken(&self, address: u64) -> Result<bool> {
        let (byte, bit) = self.position(address)?;
        Ok(self.bitmap[byte] & (1 << bit) != 0)
    }

    /// Set the bit for `address`; setting an already-set bit is a no-op
    pub fn mark_allocated(&mut self, address: u64) -> Result<()> {
        let (byte, bit) = self.position(address)?;
        self.bitmap[byte] |= 1 << bit;
        Ok(())
    }

    /// Clear the bit for `address`; clearing a clear bit is a no-op
    pub fn mark_free(&mut self, address: u64) -> Result<()> {
        let (byte, bit) = self.position(address)?;
        self.bitmap[byte] &= !(1 << bit);
        Ok(())
    }

    /// Count free addresses
    pub fn count_free(&self) -> u64 {
        let taken: u64 = self.bitmap.iter().map(|b| b.count_ones() as u64).sum();
        self.capacity() - taken
    }

    /// Set every bit (used by tests and recovery to start from "all taken")
    pub fn mark_all_allocated(&mut self) {
        self.bitmap.fill(0xFF);
        // Keep padding bits past the last address clear
        let tail = (self.capacity() % 8) as u8;
        if tail != 0 {
            if let Some(last) = self.bitmap.last_mut() {
                *last = (1u8 << tail) - 1;
            }
        }
    }
}

impl fmt::Display for AddressMap {
    /// Literal bit string, least-significant bit first within each byte
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bitmap {
            for bit in 0..8 {
                let c = if byte & (1 << bit) != 0 { '1' } else { '0' };
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}
