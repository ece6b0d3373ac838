//! Storage engine: one volume, its allocator and its lease wheel
//!
//! ```text
//! Engine
//!  ├─ Volume     (device + per-address cipher)
//!  ├─ Allocator  (address space behind a turn queue)
//!  ├─ TimeWheel  (background driver, lease expiry)
//!  └─ bitmap file (optional, sealed to the volume id)
//! ```

use crate::allocator::{AddressLease, AddressSpace, Allocator};
use crate::block::ResourceType;
use crate::chain::{rebuild_address_space, scan_address_space, FileBlockMap, ScanMode};
use crate::config::EngineConfig;
use crate::encryption::{BlockCipher, EncryptionKey};
use crate::error::{Result, VaultError};
use crate::io::BlockDevice;
use crate::timewheel::TimeWheel;
use crate::volume::Volume;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Identifies a volume; persisted bitmaps are bound to it
pub type VolumeId = [u8; 16];

pub struct Engine {
    config: EngineConfig,
    volume: Arc<Volume>,
    allocator: Arc<Allocator>,
    wheel: Arc<TimeWheel>,
    volume_id: VolumeId,
    bitmap_path: Option<PathBuf>,
}

impl Engine {
    /// Open a volume, loading the bitmap from `bitmap_path` when it exists
    ///
    /// Without a bitmap file the address space is rebuilt by scanning the
    /// device, so blocks already on it are never handed out again.
    pub fn open(
        config: EngineConfig,
        device: Arc<dyn BlockDevice>,
        root_key: EncryptionKey,
        volume_id: VolumeId,
        bitmap_path: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        check_block_size(&config, device.as_ref())?;
        let cipher = BlockCipher::new(config.cipher, root_key);

        let space = match bitmap_path.as_deref() {
            Some(path) if path.exists() => {
                let space =
                    AddressSpace::load_bitmap(path, &cipher, &volume_id, config.cache_capacity)?;
                check_range(&config, &space)?;
                space
            }
            _ => {
                info!("No bitmap file, scanning device for live blocks");
                let scratch = Volume::new(Arc::clone(&device), cipher.clone());
                scan_address_space(
                    &scratch,
                    config.address_size,
                    config.address_offset,
                    config.cache_capacity,
                )?
            }
        };

        Engine::assemble(config, device, cipher, space, volume_id, bitmap_path)
    }

    /// Open a volume whose bitmap is missing or untrusted
    ///
    /// The address space is rebuilt from every chain reachable from `roots`.
    pub fn rebuild(
        config: EngineConfig,
        device: Arc<dyn BlockDevice>,
        root_key: EncryptionKey,
        volume_id: VolumeId,
        bitmap_path: Option<PathBuf>,
        roots: &[u64],
    ) -> Result<Self> {
        config.validate()?;
        check_block_size(&config, device.as_ref())?;
        let cipher = BlockCipher::new(config.cipher, root_key);
        let scratch = Volume::new(Arc::clone(&device), cipher.clone());

        let space = rebuild_address_space(
            &scratch,
            config.address_size,
            config.address_offset,
            config.cache_capacity,
            roots,
        )?;
        info!("Rebuilt address space from {} roots", roots.len());

        Engine::assemble(config, device, cipher, space, volume_id, bitmap_path)
    }

    fn assemble(
        config: EngineConfig,
        device: Arc<dyn BlockDevice>,
        cipher: BlockCipher,
        space: AddressSpace,
        volume_id: VolumeId,
        bitmap_path: Option<PathBuf>,
    ) -> Result<Self> {
        let allocator = Arc::new(Allocator::new(space, config.turn_timeout()));
        let wheel = Arc::new(TimeWheel::from_config(&config.wheel)?);
        wheel.start()?;

        if config.flush_bitmap_on_idle {
            if let Some(path) = bitmap_path.clone() {
                let weak = Arc::downgrade(&allocator);
                let cipher = cipher.clone();
                allocator.on_idle(move || {
                    if let Some(allocator) = weak.upgrade() {
                        if let Err(e) = allocator.save_bitmap(&path, &cipher, &volume_id) {
                            warn!("Idle bitmap flush failed: {}", e);
                        }
                    }
                });
            }
        }

        info!(
            "Opened volume ({} byte blocks, addresses {}..{}, cipher {:?})",
            config.block_size,
            config.address_offset,
            config.address_size,
            cipher.kind()
        );

        Ok(Engine {
            config,
            volume: Arc::new(Volume::new(device, cipher)),
            allocator,
            wheel,
            volume_id,
            bitmap_path,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn wheel(&self) -> &Arc<TimeWheel> {
        &self.wheel
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.volume_id
    }

    pub fn bitmap_path(&self) -> Option<&Path> {
        self.bitmap_path.as_deref()
    }

    /// Create an empty file or directory
    pub fn create_file(&self, resource_type: ResourceType, mode: ScanMode) -> Result<FileBlockMap> {
        Ok(
            FileBlockMap::create(Arc::clone(&self.volume), &self.allocator, resource_type, mode)?
                .with_segment_cache(self.config.lazy_cache_segments),
        )
    }

    pub fn open_file(&self, head_address: u64, mode: ScanMode) -> Result<FileBlockMap> {
        Ok(
            FileBlockMap::open(Arc::clone(&self.volume), head_address, mode)?
                .with_segment_cache(self.config.lazy_cache_segments),
        )
    }

    /// Lend an address that returns to the pool unless claimed within `timeout`
    pub fn lend_address(&self, timeout: Duration) -> Result<AddressLease> {
        self.allocator.lend(&self.wheel, timeout)
    }

    pub fn claim_address(&self, lease: AddressLease) -> Result<u64> {
        self.allocator.claim(&self.wheel, lease)
    }

    /// Persist the bitmap; does nothing without a bitmap path
    pub fn save_bitmap(&self) -> Result<()> {
        match &self.bitmap_path {
            Some(path) => self
                .allocator
                .save_bitmap(path, self.volume.cipher(), &self.volume_id),
            None => Ok(()),
        }
    }

    /// Stop the lease wheel, persist the bitmap and sync the device
    ///
    /// Leases still outstanding are neither fired nor reclaimed; their
    /// addresses stay allocated in the saved bitmap.
    pub fn close(self) -> Result<()> {
        self.wheel.stop();
        let outstanding = self.wheel.outstanding();
        if outstanding > 0 {
            warn!("Closing with {} address leases outstanding", outstanding);
        }
        self.save_bitmap()?;
        self.volume.sync()?;
        info!("Closed volume");
        Ok(())
    }
}

fn check_range(config: &EngineConfig, space: &AddressSpace) -> Result<()> {
    let map = space.map();
    if map.size() != config.address_size || map.offset() != config.address_offset {
        return Err(VaultError::Config(format!(
            "bitmap covers {}..{} but address_size/address_offset are {}..{}",
            map.offset(),
            map.size(),
            config.address_offset,
            config.address_size
        )));
    }
    Ok(())
}

fn check_block_size(config: &EngineConfig, device: &dyn BlockDevice) -> Result<()> {
    if device.block_size() != config.block_size {
        return Err(VaultError::Config(format!(
            "block_size {} does not match device block size {}",
            config.block_size,
            device.block_size()
        )));
    }
    Ok(())
}
