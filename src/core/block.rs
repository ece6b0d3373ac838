//! Binary block format
//!
//! Every block is `block_size` bytes: a 64-byte clear header followed by a
//! body that is sealed with the volume cipher keyed by the block's address.
//!
//! ```text
//! Offset  Size  Field
//! 0       1     block type tag (1 = head, 2 = link, 3 = data)
//! 1       4     CRC-32 over address || plaintext body
//! 5       8     created (seconds, head only)
//! 13      8     modified (seconds, head only)
//! 21      8     next block address (0 = none)
//! 29      1     resource type (0 = directory, 1 = file, head only)
//! 30      4     body size in bytes
//! 34      12    AES-GCM nonce
//! 46      16    AES-GCM tag
//! 62      2     reserved
//! 64..          body: packed u64 address array, or raw data bytes
//! ```
//!
//! All integers are little-endian. A [`Block`] is plaintext and mutable;
//! [`Block::finalize`] turns it into a [`SealedBlock`] ready for the device,
//! and [`SealedBlock::prepare`] turns device bytes back into a verified
//! [`Block`].

use crate::encryption::{BlockCipher, SealParams, NONCE_SIZE, TAG_SIZE};
use crate::error::{Result, VaultError};
use tracing::warn;

/// Size of the shared block header
pub const HEADER_SIZE: usize = 64;

/// Width of one packed address
pub const ADDRESS_SIZE: usize = 8;

/// Smallest block size a volume may use
pub const MIN_BLOCK_SIZE: usize = 128;

const OFF_TYPE: usize = 0;
const OFF_CHECKSUM: usize = 1;
const OFF_CREATED: usize = 5;
const OFF_MODIFIED: usize = 13;
const OFF_NEXT: usize = 21;
const OFF_RESOURCE: usize = 29;
const OFF_BODY_SIZE: usize = 30;
const OFF_NONCE: usize = 34;
const OFF_TAG: usize = OFF_NONCE + NONCE_SIZE;
const OFF_RESERVED: usize = OFF_TAG + TAG_SIZE;

/// Header bytes covered by the authentication tag
const AUTHENTICATED_HEADER: usize = OFF_NONCE;

/// Block variants, distinguished by the tag at offset 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    /// First block of a file or directory chain
    Head = 1,
    /// Continuation of a chain's address list
    Link = 2,
    /// Raw payload
    Data = 3,
}

impl BlockType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(BlockType::Head),
            2 => Ok(BlockType::Link),
            3 => Ok(BlockType::Data),
            _ => Err(VaultError::InvalidBlockType(value)),
        }
    }
}

/// What a head block describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceType {
    Directory = 0,
    File = 1,
}

impl ResourceType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ResourceType::Directory),
            1 => Ok(ResourceType::File),
            _ => Err(VaultError::InvalidResourceType(value)),
        }
    }
}

/// Check that a block size can hold the header and at least one address
pub fn validate_block_size(block_size: usize) -> Result<()> {
    if block_size < MIN_BLOCK_SIZE || block_size % ADDRESS_SIZE != 0 {
        return Err(VaultError::InvalidBlockSize(block_size));
    }
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn compute_checksum(address: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&address.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

fn associated_data(address: u64, header: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(ADDRESS_SIZE + AUTHENTICATED_HEADER);
    aad.extend_from_slice(&address.to_le_bytes());
    aad.extend_from_slice(&header[..AUTHENTICATED_HEADER]);
    aad
}

fn seal_params(header: &[u8]) -> SealParams {
    let mut params = SealParams::default();
    params
        .nonce
        .copy_from_slice(&header[OFF_NONCE..OFF_NONCE + NONCE_SIZE]);
    params.tag.copy_from_slice(&header[OFF_TAG..OFF_TAG + TAG_SIZE]);
    params
}

fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A plaintext block whose fields can be read and written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    kind: BlockType,
    bytes: Vec<u8>,
}

impl Block {
    /// Create an empty block with a zeroed header
    pub fn new(kind: BlockType, block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;
        let mut bytes = vec![0u8; block_size];
        bytes[OFF_TYPE] = kind as u8;
        Ok(Block { kind, bytes })
    }

    /// Create a head block stamped with the current time
    pub fn head(block_size: usize, resource_type: ResourceType) -> Result<Self> {
        let mut block = Block::new(BlockType::Head, block_size)?;
        let now = now_seconds();
        block.set_created(now);
        block.set_modified(now);
        block.set_resource_type(resource_type);
        Ok(block)
    }

    pub fn link(block_size: usize) -> Result<Self> {
        Block::new(BlockType::Link, block_size)
    }

    /// Create a data block holding `payload`
    pub fn data(block_size: usize, payload: &[u8]) -> Result<Self> {
        let mut block = Block::new(BlockType::Data, block_size)?;
        block.set_body(payload)?;
        Ok(block)
    }

    pub fn block_type(&self) -> BlockType {
        self.kind
    }

    pub fn block_size(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes available for the body
    pub fn body_capacity(&self) -> usize {
        self.bytes.len() - HEADER_SIZE
    }

    /// Number of addresses the body can hold
    pub fn address_capacity(&self) -> usize {
        self.body_capacity() / ADDRESS_SIZE
    }

    /// Stored checksum (zero until finalized)
    pub fn checksum(&self) -> u32 {
        read_u32(&self.bytes, OFF_CHECKSUM)
    }

    pub fn created(&self) -> i64 {
        read_u64(&self.bytes, OFF_CREATED) as i64
    }

    pub fn set_created(&mut self, seconds: i64) {
        self.bytes[OFF_CREATED..OFF_CREATED + 8].copy_from_slice(&seconds.to_le_bytes());
    }

    pub fn modified(&self) -> i64 {
        read_u64(&self.bytes, OFF_MODIFIED) as i64
    }

    pub fn set_modified(&mut self, seconds: i64) {
        self.bytes[OFF_MODIFIED..OFF_MODIFIED + 8].copy_from_slice(&seconds.to_le_bytes());
    }

    /// Stamp `modified` with the current time
    pub fn touch(&mut self) {
        self.set_modified(now_seconds());
    }

    /// Next block in the chain, `None` at the end
    pub fn next(&self) -> Option<u64> {
        match read_u64(&self.bytes, OFF_NEXT) {
            0 => None,
            address => Some(address),
        }
    }

    pub fn set_next(&mut self, next: Option<u64>) {
        let raw = next.unwrap_or(0);
        self.bytes[OFF_NEXT..OFF_NEXT + 8].copy_from_slice(&raw.to_le_bytes());
    }

    pub fn resource_type(&self) -> Result<ResourceType> {
        ResourceType::from_u8(self.bytes[OFF_RESOURCE])
    }

    pub fn set_resource_type(&mut self, resource_type: ResourceType) {
        self.bytes[OFF_RESOURCE] = resource_type as u8;
    }

    pub fn body_size(&self) -> u32 {
        read_u32(&self.bytes, OFF_BODY_SIZE)
    }

    fn set_body_size(&mut self, size: usize) {
        self.bytes[OFF_BODY_SIZE..OFF_BODY_SIZE + 4].copy_from_slice(&(size as u32).to_le_bytes());
    }

    /// Body bytes up to `body_size`
    pub fn body(&self) -> &[u8] {
        let len = (self.body_size() as usize).min(self.body_capacity());
        &self.bytes[HEADER_SIZE..HEADER_SIZE + len]
    }

    /// Replace the body, failing if it does not fit
    pub fn set_body(&mut self, body: &[u8]) -> Result<()> {
        let capacity = self.body_capacity();
        if body.len() > capacity {
            return Err(VaultError::Overflow {
                needed: body.len(),
                capacity,
            });
        }
        self.bytes[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(body);
        self.set_body_size(body.len());
        Ok(())
    }

    pub fn address_count(&self) -> usize {
        self.body().len() / ADDRESS_SIZE
    }

    /// Decode the body as a packed address array
    pub fn addresses(&self) -> Vec<u64> {
        self.body()
            .chunks_exact(ADDRESS_SIZE)
            .map(|chunk| read_u64(chunk, 0))
            .collect()
    }

    /// Replace the address array; recomputes `body_size`
    pub fn set_addresses(&mut self, addresses: &[u64]) -> Result<()> {
        let needed = addresses.len() * ADDRESS_SIZE;
        let capacity = self.body_capacity();
        if needed > capacity {
            return Err(VaultError::Overflow { needed, capacity });
        }
        for (i, address) in addresses.iter().enumerate() {
            let start = HEADER_SIZE + i * ADDRESS_SIZE;
            self.bytes[start..start + ADDRESS_SIZE].copy_from_slice(&address.to_le_bytes());
        }
        self.set_body_size(needed);
        Ok(())
    }

    /// Append one address to the array
    pub fn push_address(&mut self, address: u64) -> Result<()> {
        let count = self.address_count();
        let needed = (count + 1) * ADDRESS_SIZE;
        let capacity = self.body_capacity();
        if needed > capacity {
            return Err(VaultError::Overflow { needed, capacity });
        }
        let start = HEADER_SIZE + count * ADDRESS_SIZE;
        self.bytes[start..start + ADDRESS_SIZE].copy_from_slice(&address.to_le_bytes());
        self.set_body_size(needed);
        Ok(())
    }

    /// Pad, checksum and encrypt the block for `address`
    ///
    /// Unused body bytes are zeroed before the checksum is taken, so nothing
    /// left over in the buffer reaches the device.
    pub fn finalize(mut self, address: u64, cipher: &BlockCipher) -> Result<SealedBlock> {
        let used = HEADER_SIZE + (self.body_size() as usize).min(self.body_capacity());
        self.bytes[used..].fill(0);

        let (header, body) = self.bytes.split_at_mut(HEADER_SIZE);
        let checksum = compute_checksum(address, body);
        header[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());

        let aad = associated_data(address, header);
        let params = cipher.seal(address, &aad, body)?;
        header[OFF_NONCE..OFF_NONCE + NONCE_SIZE].copy_from_slice(&params.nonce);
        header[OFF_TAG..OFF_TAG + TAG_SIZE].copy_from_slice(&params.tag);

        Ok(SealedBlock {
            kind: self.kind,
            bytes: self.bytes,
        })
    }
}

/// A finalized block: encrypted body, clear header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    kind: BlockType,
    bytes: Vec<u8>,
}

impl SealedBlock {
    /// Wrap raw device bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        validate_block_size(bytes.len())?;
        let kind = BlockType::from_u8(bytes[OFF_TYPE])?;
        Ok(SealedBlock { kind, bytes })
    }

    pub fn block_type(&self) -> BlockType {
        self.kind
    }

    pub fn checksum(&self) -> u32 {
        read_u32(&self.bytes, OFF_CHECKSUM)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Decrypt and verify the block as stored at `address`
    ///
    /// With `check_integrity` off, authentication and checksum failures are
    /// logged and the body is decrypted anyway. That mode exists for recovery
    /// tooling only.
    pub fn prepare(
        mut self,
        address: u64,
        cipher: &BlockCipher,
        check_integrity: bool,
    ) -> Result<Block> {
        let kind = self.kind;
        let (header, body) = self.bytes.split_at_mut(HEADER_SIZE);
        let aad = associated_data(address, header);
        let params = seal_params(header);

        if check_integrity {
            if header[OFF_RESERVED..].iter().any(|&b| b != 0) {
                warn!("Block {} has reserved header bytes set", address);
                return Err(VaultError::Integrity {
                    address,
                    reason: "reserved header bytes set",
                });
            }
            if let Err(e) = cipher.open(address, &aad, body, &params) {
                warn!("Block {} failed authentication", address);
                return Err(e);
            }
            let expected = read_u32(header, OFF_CHECKSUM);
            if compute_checksum(address, body) != expected {
                warn!("Block {} checksum mismatch", address);
                return Err(VaultError::Integrity {
                    address,
                    reason: "checksum mismatch",
                });
            }
            if read_u32(header, OFF_BODY_SIZE) as usize > body.len() {
                return Err(VaultError::Integrity {
                    address,
                    reason: "body size exceeds block capacity",
                });
            }
        } else if cipher.open(address, &aad, body, &params).is_err() {
            warn!(
                "Block {} failed authentication, decrypting without verification",
                address
            );
            cipher.open_unverified(address, body, &params);
        }

        Ok(Block {
            kind,
            bytes: self.bytes,
        })
    }
}
