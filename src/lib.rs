//! # Blockvault - Encrypted Block Storage Engine
//!
//! `blockvault` stores files as chains of fixed-size, individually encrypted
//! blocks on a flat block device:
//!
//! - **Address-bound blocks**: every block body is checksummed and sealed for
//!   the address it lives at, so a block copied elsewhere fails to open
//! - **Cached bitmap allocator**: a region-cycling cache of free addresses
//!   keeps allocation cost bounded by one region scan
//! - **FIFO allocator turns** for multi-step allocation work
//! - **Address leases** that expire through a bucketed time wheel
//! - **File block maps**: a head block and a linked chain of link blocks,
//!   scanned eagerly or lazily with cycle detection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockvault::{BlockCipher, Engine, EngineConfig, FileVolume, ResourceType, Result, ScanMode};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let config = EngineConfig::default();
//! let device = Arc::new(FileVolume::create("volume.img", config.block_size, 1024)?);
//! let key = BlockCipher::generate_key();
//!
//! let engine = Engine::open(config, device, key, [7u8; 16], Some("volume.bitmap".into()))?;
//!
//! let mut file = engine.create_file(ResourceType::File, ScanMode::Eager)?;
//! file.append_data(engine.allocator(), b"Hello, World!")?;
//! let head = file.head_address();
//!
//! let reopened = engine.open_file(head, ScanMode::Lazy)?;
//! assert_eq!(reopened.read_data(0)?, b"Hello, World!");
//!
//! engine.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Allocator Turns
//!
//! ```rust,no_run
//! use blockvault::{AddressSpace, Allocator, Result};
//! use std::time::Duration;
//!
//! # fn main() -> Result<()> {
//! let allocator = Allocator::new(AddressSpace::new(1024, 1, 64)?, Duration::from_secs(5));
//!
//! // Nothing else touches the address space until the turn ends
//! let turn = allocator.turn();
//! let addresses = turn.alloc_many(4)?;
//! turn.free(addresses[0])?;
//! turn.end();
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    allocator, block, chain, config, encryption, engine, error, io, timewheel, volume,
};

pub use crate::core::{
    allocator::{
        AddressLease, AddressMap, AddressSpace, Allocator, AllocatorTurn, SpaceStats, Turn,
        TurnQueue,
    },
    block::{Block, BlockType, ResourceType, SealedBlock, HEADER_SIZE, MIN_BLOCK_SIZE},
    chain::{
        rebuild_address_space, scan_address_space, scan_chain, Chain, FileBlockMap, ScanMode,
        Segment,
    },
    config::{EngineConfig, WheelConfig},
    encryption::{BlockCipher, CipherKind, EncryptionKey},
    engine::{Engine, VolumeId},
    error::{Result, VaultError},
    io::{BlockDevice, FileVolume, MemoryVolume},
    timewheel::{LeaseId, TimeWheel, MAX_TIMEOUT},
    volume::Volume,
};
