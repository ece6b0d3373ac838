//! File block maps: a head block plus a chain of link blocks
//!
//! A file is identified by the address of its head block. The head and every
//! link carry a packed array of data block addresses and a `next` pointer:
//!
//! ```text
//! Head [d0 d1 .. dn] -> Link [..] -> Link [..] -> (end)
//! ```
//!
//! Chains are walked with a visited set, so a corrupted `next` pointer that
//! loops back is reported as [`VaultError::CircularReference`] instead of
//! spinning forever.
//!
//! Two traversal policies, chosen by the caller at open time:
//! - [`ScanMode::Eager`]: the whole chain is read and verified on open
//! - [`ScanMode::Lazy`]: links are read on demand, only as far as a lookup
//!   needs, with recently used segments kept in an LRU cache

use crate::allocator::{AddressSpace, Allocator, AllocatorTurn};
use crate::block::{Block, BlockType, ResourceType};
use crate::error::{Result, VaultError};
use crate::volume::Volume;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Link segments cached by a lazily opened map unless told otherwise
pub const DEFAULT_SEGMENT_CACHE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Read the whole chain when the map is opened
    Eager,
    /// Read links only when a lookup reaches them
    Lazy,
}

/// The addresses held by one head or link block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Where the head or link block lives
    pub address: u64,
    pub addresses: Vec<u64>,
    pub next: Option<u64>,
}

impl Segment {
    fn from_block(address: u64, block: &Block) -> Self {
        Segment {
            address,
            addresses: block.addresses(),
            next: block.next(),
        }
    }
}

/// A fully scanned chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub head: Segment,
    pub links: Vec<Segment>,
}

impl Chain {
    /// Head address followed by every link address
    pub fn block_addresses(&self) -> Vec<u64> {
        std::iter::once(self.head.address)
            .chain(self.links.iter().map(|link| link.address))
            .collect()
    }

    /// Data addresses in file order
    pub fn data_addresses(&self) -> Vec<u64> {
        self.segments()
            .flat_map(|segment| segment.addresses.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.segments().map(|segment| segment.addresses.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn segments(&self) -> impl Iterator<Item = &Segment> {
        std::iter::once(&self.head).chain(self.links.iter())
    }
}

/// Read the head at `head_address` and follow its links to the end
///
/// A repeated address fails with `CircularReference` and a link that cannot
/// be read fails with `PartialScan`. Both carry the chain read so far, data
/// addresses included.
pub fn scan_chain(volume: &Volume, head_address: u64) -> Result<Chain> {
    let head_block = volume.read_expect(head_address, BlockType::Head)?;
    let head = Segment::from_block(head_address, &head_block);

    let mut seen = HashSet::from([head_address]);
    let mut links: Vec<Segment> = Vec::new();
    let mut next = head.next;

    while let Some(address) = next {
        if !seen.insert(address) {
            warn!(
                "Circular reference to block {} in chain of head {}",
                address, head_address
            );
            return Err(VaultError::CircularReference {
                address,
                partial: Box::new(Chain { head, links }),
            });
        }

        let block = match volume.read_expect(address, BlockType::Link) {
            Ok(block) => block,
            Err(source) => {
                warn!(
                    "Chain of head {} unreadable at link {}: {}",
                    head_address, address, source
                );
                return Err(VaultError::PartialScan {
                    address,
                    partial: Box::new(Chain { head, links }),
                    source: Box::new(source),
                });
            }
        };

        let segment = Segment::from_block(address, &block);
        next = segment.next;
        links.push(segment);
    }

    debug!("Scanned chain of head {}: {} links", head_address, links.len());
    Ok(Chain { head, links })
}

/// Rebuild an address space by marking everything reachable from `roots`
///
/// Used when no persisted bitmap is available.
pub fn rebuild_address_space(
    volume: &Volume,
    size: u64,
    offset: u64,
    cache_capacity: usize,
    roots: &[u64],
) -> Result<AddressSpace> {
    let mut space = AddressSpace::new(size, offset, cache_capacity)?;
    for &root in roots {
        let chain = scan_chain(volume, root)?;
        for address in chain
            .block_addresses()
            .into_iter()
            .chain(chain.data_addresses())
        {
            space.mark_allocated(address)?;
        }
    }
    debug!(
        "Rebuilt address space from {} roots, {} addresses free",
        roots.len(),
        space.map().count_free()
    );
    Ok(space)
}

fn mark_reachable(space: &mut AddressSpace, chain: &Chain) -> Result<()> {
    for address in chain
        .block_addresses()
        .into_iter()
        .chain(chain.data_addresses())
    {
        if space.map().contains(address) {
            space.mark_allocated(address)?;
        } else {
            warn!(
                "Chain of head {} references address {} outside the space",
                chain.head.address, address
            );
        }
    }
    Ok(())
}

/// Rebuild an address space from the blocks on the device
///
/// Every address the device holds is read. A written block is taken whether it
/// verifies or not, and so is every address reachable from a verified head.
/// All-zero blocks stay free. Damaged chains contribute the part that could be
/// read.
pub fn scan_address_space(
    volume: &Volume,
    size: u64,
    offset: u64,
    cache_capacity: usize,
) -> Result<AddressSpace> {
    let mut space = AddressSpace::new(size, offset, cache_capacity)?;
    let end = volume.block_count()?.min(size);
    let mut heads = Vec::new();
    let mut unreadable = 0u64;

    for address in offset..end {
        match volume.read_if_written(address) {
            Ok(None) => continue,
            Ok(Some(block)) => {
                if block.block_type() == BlockType::Head {
                    heads.push(address);
                }
            }
            Err(e) if e.is_corruption() => {
                warn!("Block {} is written but unreadable, keeping it: {}", address, e);
                unreadable += 1;
            }
            Err(e) => return Err(e),
        }
        space.mark_allocated(address)?;
    }

    for &head in &heads {
        let chain = match scan_chain(volume, head) {
            Ok(chain) => chain,
            Err(VaultError::CircularReference { partial, .. })
            | Err(VaultError::PartialScan { partial, .. }) => *partial,
            Err(e) => return Err(e),
        };
        mark_reachable(&mut space, &chain)?;
    }

    info!(
        "Scanned {} blocks: {} heads, {} unreadable, {} addresses free",
        end.saturating_sub(offset),
        heads.len(),
        unreadable,
        space.count_free()
    );
    Ok(space)
}

/// Data block addresses of one file
pub struct FileBlockMap {
    volume: Arc<Volume>,
    head_address: u64,
    head: Block,
    mode: ScanMode,
    /// Every link segment, in order (eager mode only)
    links: Vec<Segment>,
    /// Recently read link segments by address (lazy mode only)
    segments: Mutex<LruCache<u64, Segment>>,
}

impl FileBlockMap {
    fn assemble(volume: Arc<Volume>, head_address: u64, head: Block, mode: ScanMode) -> Self {
        FileBlockMap {
            volume,
            head_address,
            head,
            mode,
            links: Vec::new(),
            segments: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_SEGMENT_CACHE).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Allocate and write an empty head block
    pub fn create(
        volume: Arc<Volume>,
        allocator: &Allocator,
        resource_type: ResourceType,
        mode: ScanMode,
    ) -> Result<Self> {
        let head = Block::head(volume.block_size(), resource_type)?;
        let turn = allocator.turn();
        let head_address = turn.alloc()?;

        if let Err(e) = volume.write(head_address, head.clone()) {
            turn.free(head_address)?;
            return Err(e);
        }
        turn.end();

        debug!("Created {:?} head at {}", resource_type, head_address);
        Ok(FileBlockMap::assemble(volume, head_address, head, mode))
    }

    /// Open the file whose head lives at `head_address`
    ///
    /// Any failure, including corruption found by an eager scan, is wrapped in
    /// `VaultError::Open`.
    pub fn open(volume: Arc<Volume>, head_address: u64, mode: ScanMode) -> Result<Self> {
        let wrap = |source: VaultError| VaultError::Open {
            address: head_address,
            source: Box::new(source),
        };

        let head = volume
            .read_expect(head_address, BlockType::Head)
            .map_err(wrap)?;
        let mut map = FileBlockMap::assemble(volume, head_address, head, mode);

        if mode == ScanMode::Eager {
            let chain = scan_chain(&map.volume, head_address).map_err(wrap)?;
            map.links = chain.links;
        }
        Ok(map)
    }

    /// Change how many link segments a lazy map keeps cached
    pub fn with_segment_cache(self, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        self.segments.lock().resize(capacity);
        self
    }

    pub fn head_address(&self) -> u64 {
        self.head_address
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn created(&self) -> i64 {
        self.head.created()
    }

    pub fn modified(&self) -> i64 {
        self.head.modified()
    }

    pub fn resource_type(&self) -> Result<ResourceType> {
        self.head.resource_type()
    }

    fn head_segment(&self) -> Segment {
        Segment::from_block(self.head_address, &self.head)
    }

    fn load_link(&self, address: u64) -> Result<Segment> {
        if let Some(segment) = self.segments.lock().get(&address) {
            return Ok(segment.clone());
        }
        let block = self.volume.read_expect(address, BlockType::Link)?;
        let segment = Segment::from_block(address, &block);
        self.segments.lock().put(address, segment.clone());
        Ok(segment)
    }

    /// Visit segments in chain order until `visit` breaks or the chain ends
    fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Segment) -> ControlFlow<()>,
    {
        let head = self.head_segment();
        if visit(&head).is_break() {
            return Ok(());
        }

        match self.mode {
            ScanMode::Eager => {
                for link in &self.links {
                    if visit(link).is_break() {
                        break;
                    }
                }
            }
            ScanMode::Lazy => {
                let mut seen = HashSet::from([self.head_address]);
                let mut links: Vec<Segment> = Vec::new();
                let mut next = head.next;

                while let Some(address) = next {
                    if !seen.insert(address) {
                        return Err(VaultError::CircularReference {
                            address,
                            partial: Box::new(Chain { head, links }),
                        });
                    }
                    let link = self.load_link(address)?;
                    if visit(&link).is_break() {
                        break;
                    }
                    next = link.next;
                    links.push(link);
                }
            }
        }
        Ok(())
    }

    /// Data address at position `index`, reading no further than needed
    pub fn address_at(&self, index: usize) -> Result<u64> {
        let mut remaining = index;
        let mut found = None;
        self.walk(|segment| {
            if remaining < segment.addresses.len() {
                found = Some(segment.addresses[remaining]);
                ControlFlow::Break(())
            } else {
                remaining -= segment.addresses.len();
                ControlFlow::Continue(())
            }
        })?;

        found.ok_or(VaultError::IndexOutOfBounds {
            index,
            len: index - remaining,
        })
    }

    /// Every data address in file order
    pub fn data_addresses(&self) -> Result<Vec<u64>> {
        let mut addresses = Vec::new();
        self.walk(|segment| {
            addresses.extend_from_slice(&segment.addresses);
            ControlFlow::Continue(())
        })?;
        Ok(addresses)
    }

    /// Link block addresses in chain order
    pub fn link_addresses(&self) -> Result<Vec<u64>> {
        let mut links = Vec::new();
        self.walk(|segment| {
            if segment.address != self.head_address {
                links.push(segment.address);
            }
            ControlFlow::Continue(())
        })?;
        Ok(links)
    }

    /// Number of data addresses
    pub fn len(&self) -> Result<usize> {
        let mut len = 0;
        self.walk(|segment| {
            len += segment.addresses.len();
            ControlFlow::Continue(())
        })?;
        Ok(len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read the payload of the data block at `index`
    pub fn read_data(&self, index: usize) -> Result<Vec<u8>> {
        let address = self.address_at(index)?;
        let block = self.volume.read_expect(address, BlockType::Data)?;
        Ok(block.body().to_vec())
    }

    fn tail(&self) -> Result<Segment> {
        let mut tail = None;
        self.walk(|segment| {
            tail = Some(segment.clone());
            ControlFlow::Continue(())
        })?;
        Ok(tail.unwrap_or_else(|| self.head_segment()))
    }

    fn write_link(&self, segment: &Segment) -> Result<()> {
        let mut block = Block::link(self.volume.block_size())?;
        block.set_addresses(&segment.addresses)?;
        block.set_next(segment.next);
        self.volume.write(segment.address, block)
    }

    fn write_head(&mut self, mut head: Block) -> Result<()> {
        head.touch();
        self.volume.write(self.head_address, head.clone())?;
        self.head = head;
        Ok(())
    }

    /// Store `segment` as the new state of a link already in the chain
    fn remember_link(&mut self, segment: Segment) {
        match self.mode {
            ScanMode::Eager => {
                if let Some(link) = self
                    .links
                    .iter_mut()
                    .find(|link| link.address == segment.address)
                {
                    *link = segment;
                }
            }
            ScanMode::Lazy => {
                self.segments.lock().put(segment.address, segment);
            }
        }
    }

    fn append_in_turn(&mut self, turn: &AllocatorTurn<'_>, data_address: u64) -> Result<()> {
        let capacity = self.head.address_capacity();
        let mut tail = self.tail()?;

        if tail.addresses.len() < capacity {
            tail.addresses.push(data_address);
            if tail.address == self.head_address {
                let mut head = self.head.clone();
                head.set_addresses(&tail.addresses)?;
                return self.write_head(head);
            }
            self.write_link(&tail)?;
            self.remember_link(tail);
            return self.write_head(self.head.clone());
        }

        // Tail is full: the new link goes to disk before anything points at it
        let link_address = turn.alloc()?;
        let link = Segment {
            address: link_address,
            addresses: vec![data_address],
            next: None,
        };
        if let Err(e) = self.write_link(&link) {
            turn.free(link_address)?;
            return Err(e);
        }

        tail.next = Some(link_address);
        if tail.address == self.head_address {
            let mut head = self.head.clone();
            head.set_next(Some(link_address));
            self.write_head(head)?;
        } else {
            self.write_link(&tail)?;
            self.remember_link(tail);
            self.write_head(self.head.clone())?;
        }

        debug!("Head {} grew link {}", self.head_address, link_address);
        match self.mode {
            ScanMode::Eager => self.links.push(link),
            ScanMode::Lazy => {
                self.segments.lock().put(link_address, link);
            }
        }
        Ok(())
    }

    /// Append an already written data block address
    pub fn append(&mut self, allocator: &Allocator, data_address: u64) -> Result<()> {
        let turn = allocator.turn();
        self.append_in_turn(&turn, data_address)?;
        turn.end();
        Ok(())
    }

    /// Write `payload` to a new data block and append it; returns its address
    pub fn append_data(&mut self, allocator: &Allocator, payload: &[u8]) -> Result<u64> {
        let block = Block::data(self.volume.block_size(), payload)?;
        let turn = allocator.turn();
        let data_address = turn.alloc()?;

        let appended = self
            .volume
            .write(data_address, block)
            .and_then(|_| self.append_in_turn(&turn, data_address));
        if let Err(e) = appended {
            turn.free(data_address)?;
            return Err(e);
        }

        turn.end();
        Ok(data_address)
    }

    /// Release every link and data block, keeping the head at its address
    ///
    /// Freed blocks are zeroed so a device scan sees them as never written.
    /// Returns the freed addresses, data blocks first.
    pub fn truncate(&mut self, allocator: &Allocator) -> Result<Vec<u64>> {
        let mut freed = self.data_addresses()?;
        freed.extend(self.link_addresses()?);

        let turn = allocator.turn();
        let mut head = self.head.clone();
        head.set_addresses(&[])?;
        head.set_next(None);
        self.write_head(head)?;

        for &address in &freed {
            self.volume.zero(address)?;
            turn.free(address)?;
        }
        turn.end();

        self.links.clear();
        self.segments.lock().clear();
        debug!(
            "Truncated head {}, freed {} blocks",
            self.head_address,
            freed.len()
        );
        Ok(freed)
    }
}

#[cfg(test)]
mod tests;
