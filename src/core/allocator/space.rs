//! Address space: an [`AddressMap`] plus a replenishing cache of free addresses
//!
//! The bitmap is divided into regions of `cache_capacity` addresses. When the
//! cache runs dry, [`AddressSpace::fast_replenish`] scans exactly one region
//! (round-robin, the cursor persists across calls), moves every free address
//! it finds into the cache and marks it taken. Only after a whole cycle of
//! regions turns up nothing is the space reported as exhausted.
//!
//! Freed addresses go straight back to the bitmap, not to the cache; they are
//! picked up again the next time the scanner passes their region.

use super::bitmap::AddressMap;
use crate::encryption::{open_container, seal_container, BlockCipher};
use crate::error::{Result, VaultError};
use std::path::Path;
use tracing::{debug, info, trace, warn};

const BITMAP_MAGIC: &[u8; 4] = b"BVBM";
const BITMAP_VERSION: u8 = 1;
const BITMAP_PREAMBLE: usize = 6;

/// Point-in-time allocator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceStats {
    pub size: u64,
    pub offset: u64,
    /// Addresses currently held in the cache
    pub cached: usize,
    /// Free addresses in the bitmap (excluding cached ones)
    pub free: u64,
    pub regions: u64,
    /// Region the next replenish will scan
    pub cursor: u64,
    /// Total region scans performed by `fast_replenish`
    pub replenish_scans: u64,
}

#[derive(Debug, Clone)]
pub struct AddressSpace {
    map: AddressMap,
    /// Stack of cached addresses; the top is the next one handed out
    cache: Vec<u64>,
    cache_capacity: usize,
    cursor: u64,
    replenish_scans: u64,
}

impl AddressSpace {
    /// Create an empty space tracking `offset..size`
    pub fn new(size: u64, offset: u64, cache_capacity: usize) -> Result<Self> {
        AddressSpace::from_map(AddressMap::new(size, offset)?, cache_capacity)
    }

    /// Wrap an existing map with an empty cache
    pub fn from_map(map: AddressMap, cache_capacity: usize) -> Result<Self> {
        if cache_capacity == 0 {
            return Err(VaultError::Config(
                "cache capacity must be at least 1".to_string(),
            ));
        }
        Ok(AddressSpace {
            map,
            cache: Vec::with_capacity(cache_capacity),
            cache_capacity,
            cursor: 0,
            replenish_scans: 0,
        })
    }

    pub fn map(&self) -> &AddressMap {
        &self.map
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    /// Index of the top cached entry, -1 when the cache is empty
    pub fn cache_health(&self) -> isize {
        self.cache.len() as isize - 1
    }

    /// Addresses currently cached, bottom of the stack first
    pub fn cached(&self) -> &[u64] {
        &self.cache
    }

    /// Number of `cache_capacity`-wide regions in the bitmap
    pub fn region_count(&self) -> u64 {
        let capacity = self.cache_capacity as u64;
        (self.map.capacity() + capacity - 1) / capacity
    }

    pub fn stats(&self) -> SpaceStats {
        SpaceStats {
            size: self.map.size(),
            offset: self.map.offset(),
            cached: self.cache.len(),
            free: self.map.count_free(),
            regions: self.region_count(),
            cursor: self.cursor,
            replenish_scans: self.replenish_scans,
        }
    }

    /// Free bits in the map. Cached addresses count as taken.
    pub fn count_free(&self) -> u64 {
        self.map.count_free()
    }

    pub fn is_taken(&self, address: u64) -> Result<bool> {
        self.map.is_taken(address)
    }

    /// Mark an address as owned without going through the cache
    pub fn mark_allocated(&mut self, address: u64) -> Result<()> {
        self.map.mark_allocated(address)
    }

    /// Hand out one address
    pub fn alloc(&mut self) -> Result<u64> {
        if self.cache.is_empty() {
            self.fast_replenish()?;
        }
        match self.cache.pop() {
            Some(address) => {
                trace!("Allocated address {}", address);
                Ok(address)
            }
            None => Err(self.exhausted()),
        }
    }

    /// Return `address` to the bitmap
    pub fn free(&mut self, address: u64) -> Result<()> {
        self.map.mark_free(address)?;
        trace!("Freed address {}", address);
        Ok(())
    }

    fn exhausted(&self) -> VaultError {
        VaultError::AddressExhausted {
            size: self.map.size(),
            offset: self.map.offset(),
            regions: self.region_count(),
        }
    }

    fn region_bounds(&self, region: u64) -> (u64, u64) {
        let start = self.map.offset() + region * self.cache_capacity as u64;
        let end = (start + self.cache_capacity as u64).min(self.map.size());
        (start, end)
    }

    /// Refill the cache from the next region that has free addresses
    ///
    /// Returns how many addresses were cached. Scans at most one full cycle of
    /// regions before failing with `AddressExhausted`.
    pub fn fast_replenish(&mut self) -> Result<usize> {
        let regions = self.region_count();

        for attempt in 0..regions {
            let region = self.cursor;
            self.cursor = (self.cursor + 1) % regions;
            self.replenish_scans += 1;

            let (start, end) = self.region_bounds(region);
            let mut found = 0;
            for address in start..end {
                if self.cache.len() == self.cache_capacity {
                    break;
                }
                if !self.map.is_taken(address)? {
                    self.map.mark_allocated(address)?;
                    self.cache.push(address);
                    found += 1;
                }
            }

            if found > 0 {
                debug!(
                    "Replenished {} addresses from region {} (attempt {})",
                    found, region, attempt
                );
                return Ok(found);
            }
        }

        warn!(
            "Address space exhausted after scanning {} regions",
            regions
        );
        Err(self.exhausted())
    }

    /// Linear scan from the first address, filling the cache until it is full
    ///
    /// Cold-start and recovery path; ignores the region cursor.
    pub fn full_replenish(&mut self) -> Result<usize> {
        let mut found = 0;
        for address in self.map.offset()..self.map.size() {
            if self.cache.len() == self.cache_capacity {
                break;
            }
            if !self.map.is_taken(address)? {
                self.map.mark_allocated(address)?;
                self.cache.push(address);
                found += 1;
            }
        }
        debug!("Full replenish cached {} addresses", found);
        Ok(found)
    }

    /// Copy of the bitmap with cached (never handed out) addresses cleared
    pub fn snapshot(&self) -> Result<AddressMap> {
        let mut map = self.map.clone();
        for &address in &self.cache {
            map.mark_free(address)?;
        }
        Ok(map)
    }

    /// Persist the bitmap, sealed to `volume_id` when the cipher is enabled
    pub fn save_bitmap<P: AsRef<Path>>(
        &self,
        path: P,
        cipher: &BlockCipher,
        volume_id: &[u8],
    ) -> Result<()> {
        let path = path.as_ref();
        let encoded = bincode::serialize(&self.snapshot()?)?;

        let (sealed, payload) = if cipher.is_enabled() {
            (1u8, seal_container(&encoded, &cipher.bitmap_key(), volume_id)?)
        } else {
            (0u8, encoded)
        };

        let mut out = Vec::with_capacity(BITMAP_PREAMBLE + payload.len());
        out.extend_from_slice(BITMAP_MAGIC);
        out.push(BITMAP_VERSION);
        out.push(sealed);
        out.extend_from_slice(&payload);

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &out).map_err(|source| VaultError::BitmapIo {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| VaultError::BitmapIo {
            path: path.to_path_buf(),
            source,
        })?;

        info!(
            "Saved bitmap ({} bytes, sealed: {}) to {}",
            out.len(),
            sealed == 1,
            path.display()
        );
        Ok(())
    }

    /// Load a bitmap written by [`AddressSpace::save_bitmap`]
    pub fn load_bitmap<P: AsRef<Path>>(
        path: P,
        cipher: &BlockCipher,
        volume_id: &[u8],
        cache_capacity: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| VaultError::BitmapIo {
            path: path.to_path_buf(),
            source,
        })?;

        if bytes.len() < BITMAP_PREAMBLE || &bytes[..4] != BITMAP_MAGIC {
            return Err(VaultError::BitmapFormat("missing bitmap magic".to_string()));
        }
        if bytes[4] != BITMAP_VERSION {
            return Err(VaultError::BitmapFormat(format!(
                "unsupported bitmap version {}",
                bytes[4]
            )));
        }

        let payload = &bytes[BITMAP_PREAMBLE..];
        let encoded = match (bytes[5], cipher.is_enabled()) {
            (1, true) => open_container(payload, &cipher.bitmap_key(), volume_id)?,
            (0, false) => payload.to_vec(),
            (1, false) => {
                return Err(VaultError::Integrity {
                    address: 0,
                    reason: "bitmap is sealed but the volume cipher is disabled",
                })
            }
            (0, true) => {
                return Err(VaultError::Integrity {
                    address: 0,
                    reason: "bitmap is not sealed for an encrypted volume",
                })
            }
            (flag, _) => {
                return Err(VaultError::BitmapFormat(format!(
                    "unknown seal flag {}",
                    flag
                )))
            }
        };

        let decoded: AddressMap = bincode::deserialize(&encoded)?;
        let map = AddressMap::from_parts(
            decoded.size(),
            decoded.offset(),
            decoded.as_bytes().to_vec(),
        )?;

        info!(
            "Loaded bitmap for {}..{} from {}",
            map.offset(),
            map.size(),
            path.display()
        );
        AddressSpace::from_map(map, cache_capacity)
    }
}
