//! Volume: a block device plus the cipher that seals its blocks
//!
//! Every read prepares (decrypts and verifies) the block against the address
//! it was read from; every write finalizes the block for the address it is
//! written to.

use crate::block::{Block, BlockType, SealedBlock};
use crate::encryption::BlockCipher;
use crate::error::{Result, VaultError};
use crate::io::BlockDevice;
use std::sync::Arc;
use tracing::trace;

pub struct Volume {
    device: Arc<dyn BlockDevice>,
    cipher: BlockCipher,
}

impl Volume {
    pub fn new(device: Arc<dyn BlockDevice>, cipher: BlockCipher) -> Self {
        Volume { device, cipher }
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    pub fn cipher(&self) -> &BlockCipher {
        &self.cipher
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    fn read_with(&self, address: u64, check_integrity: bool) -> Result<Block> {
        let bytes = self.device.read_block(address)?;
        SealedBlock::from_bytes(bytes)?.prepare(address, &self.cipher, check_integrity)
    }

    /// Blocks the device holds; see [`BlockDevice::block_count`]
    pub fn block_count(&self) -> Result<u64> {
        self.device.block_count()
    }

    /// Read and verify the block at `address`, or `None` if it is all zeros
    pub fn read_if_written(&self, address: u64) -> Result<Option<Block>> {
        let bytes = self.device.read_block(address)?;
        if bytes.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        SealedBlock::from_bytes(bytes)?
            .prepare(address, &self.cipher, true)
            .map(Some)
    }

    /// Read and verify the block at `address`
    pub fn read(&self, address: u64) -> Result<Block> {
        trace!("Reading block {}", address);
        self.read_with(address, true)
    }

    /// Read the block at `address` without failing on integrity errors
    pub fn read_unchecked(&self, address: u64) -> Result<Block> {
        self.read_with(address, false)
    }

    /// Read the block at `address` and check its type
    pub fn read_expect(&self, address: u64, expected: BlockType) -> Result<Block> {
        let block = self.read(address)?;
        if block.block_type() != expected {
            return Err(VaultError::UnexpectedBlockType {
                address,
                expected,
                found: block.block_type(),
            });
        }
        Ok(block)
    }

    /// Finalize `block` for `address` and write it
    pub fn write(&self, address: u64, block: Block) -> Result<()> {
        trace!("Writing {:?} block {}", block.block_type(), address);
        let sealed = block.finalize(address, &self.cipher)?;
        self.device.write_block(address, sealed.as_bytes())
    }

    /// Overwrite the block at `address` with zeros
    pub fn zero(&self, address: u64) -> Result<()> {
        self.device
            .write_block(address, &vec![0u8; self.device.block_size()])
    }

    pub fn sync(&self) -> Result<()> {
        self.device.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ResourceType;
    use crate::encryption::CipherKind;
    use crate::io::MemoryVolume;

    fn volume() -> (Arc<MemoryVolume>, Volume) {
        let device = Arc::new(MemoryVolume::new(256).unwrap());
        let cipher = BlockCipher::new(CipherKind::Aes256Gcm, [1u8; 32]);
        (device.clone(), Volume::new(device, cipher))
    }

    #[test]
    fn test_write_then_read() {
        let (_, volume) = volume();
        let mut head = Block::head(256, ResourceType::File).unwrap();
        head.set_addresses(&[10, 20, 30]).unwrap();
        volume.write(5, head).unwrap();

        let read = volume.read_expect(5, BlockType::Head).unwrap();
        assert_eq!(read.addresses(), vec![10, 20, 30]);
    }

    #[test]
    fn test_copied_block_fails_at_new_address() {
        let (device, volume) = volume();
        volume
            .write(5, Block::data(256, b"secret").unwrap())
            .unwrap();

        let raw = device.read_block(5).unwrap();
        device.write_block(6, &raw).unwrap();

        assert!(matches!(
            volume.read(6),
            Err(VaultError::Integrity { address: 6, .. })
        ));
    }

    #[test]
    fn test_unexpected_type() {
        let (_, volume) = volume();
        volume.write(2, Block::link(256).unwrap()).unwrap();
        assert!(matches!(
            volume.read_expect(2, BlockType::Head),
            Err(VaultError::UnexpectedBlockType { .. })
        ));
    }

    #[test]
    fn test_zeroed_block_unreadable() {
        let (_, volume) = volume();
        volume.write(3, Block::link(256).unwrap()).unwrap();
        volume.zero(3).unwrap();
        assert!(matches!(
            volume.read(3),
            Err(VaultError::InvalidBlockType(0))
        ));
        assert!(volume.read_if_written(3).unwrap().is_none());
    }

    #[test]
    fn test_read_if_written() {
        let (device, volume) = volume();
        assert!(volume.read_if_written(7).unwrap().is_none());

        volume.write(7, Block::data(256, b"kept").unwrap()).unwrap();
        let block = volume.read_if_written(7).unwrap().unwrap();
        assert_eq!(block.body(), b"kept");
        assert_eq!(volume.block_count().unwrap(), 8);

        device.with_raw_mut(7, |bytes| bytes[200] ^= 0x01);
        assert!(volume.read_if_written(7).unwrap_err().is_corruption());
    }
}
