//! Raw block devices
//!
//! A device only moves `block_size`-byte buffers to and from block addresses;
//! it knows nothing about headers or encryption.

use crate::block::validate_block_size;
use crate::error::{Result, VaultError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Positioned block storage
pub trait BlockDevice: Send + Sync {
    /// Size of every block in bytes
    fn block_size(&self) -> usize;

    /// Read the block stored at `address`
    fn read_block(&self, address: u64) -> Result<Vec<u8>>;

    /// Overwrite the block at `address`; `data` must be exactly one block
    fn write_block(&self, address: u64, data: &[u8]) -> Result<()>;

    /// Blocks backed by the device; addresses at or past this were never written
    fn block_count(&self) -> Result<u64>;

    /// Flush buffered writes to stable storage
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn check_len(block_size: usize, data: &[u8]) -> Result<()> {
    if data.len() != block_size {
        return Err(VaultError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "Block data must be exactly {} bytes, got {}",
                block_size,
                data.len()
            ),
        )));
    }
    Ok(())
}

/// Byte position of `address`; fails instead of wrapping past `u64::MAX`
fn byte_offset(address: u64, block_size: usize) -> Result<u64> {
    address.checked_mul(block_size as u64).ok_or_else(|| {
        VaultError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Block address {} is beyond any file offset", address),
        ))
    })
}

/// Block device backed by a single flat file
pub struct FileVolume {
    file: Mutex<File>,
    path: PathBuf,
    block_size: usize,
}

impl FileVolume {
    /// Create (or truncate) a volume file of `blocks` zeroed blocks
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, blocks: u64) -> Result<Self> {
        validate_block_size(block_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(byte_offset(blocks, block_size)?)?;

        Ok(FileVolume {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            block_size,
        })
    }

    /// Open an existing volume file
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(FileVolume {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            block_size,
        })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileVolume {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, address: u64) -> Result<Vec<u8>> {
        let offset = byte_offset(address, self.block_size)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; self.block_size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_block(&self, address: u64, data: &[u8]) -> Result<()> {
        check_len(self.block_size, data)?;

        let offset = byte_offset(address, self.block_size)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;

        Ok(())
    }

    fn block_count(&self) -> Result<u64> {
        let len = self.file.lock().metadata()?.len();
        Ok(len / self.block_size as u64)
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// In-memory block device; unwritten blocks read as zeros
pub struct MemoryVolume {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    block_size: usize,
}

impl MemoryVolume {
    pub fn new(block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;
        Ok(MemoryVolume {
            blocks: Mutex::new(HashMap::new()),
            block_size,
        })
    }

    /// Number of blocks that have been written at least once
    pub fn written_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Apply `f` to the stored bytes of `address` (test and repair tooling)
    pub fn with_raw_mut<F: FnOnce(&mut Vec<u8>)>(&self, address: u64, f: F) {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .entry(address)
            .or_insert_with(|| vec![0u8; self.block_size]);
        f(block);
    }
}

impl BlockDevice for MemoryVolume {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, address: u64) -> Result<Vec<u8>> {
        Ok(self
            .blocks
            .lock()
            .get(&address)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.block_size]))
    }

    fn write_block(&self, address: u64, data: &[u8]) -> Result<()> {
        check_len(self.block_size, data)?;
        self.blocks.lock().insert(address, data.to_vec());
        Ok(())
    }

    fn block_count(&self) -> Result<u64> {
        Ok(self
            .blocks
            .lock()
            .keys()
            .max()
            .map_or(0, |&highest| highest.saturating_add(1)))
    }
}
