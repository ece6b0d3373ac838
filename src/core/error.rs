use std::path::PathBuf;
use thiserror::Error;

use crate::block::BlockType;
use crate::chain::Chain;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Integrity check failed for block {address}: {reason}")]
    Integrity { address: u64, reason: &'static str },

    #[error("Address {address} out of range (size: {size}, offset: {offset})")]
    AddressOutOfRange { address: u64, size: u64, offset: u64 },

    #[error("Address space exhausted after scanning {regions} regions (size: {size}, offset: {offset})")]
    AddressExhausted { size: u64, offset: u64, regions: u64 },

    #[error("Block body overflow: {needed} bytes needed, capacity is {capacity}")]
    Overflow { needed: usize, capacity: usize },

    /// `partial` holds the head and every link read before the repeat
    #[error("Circular reference at block {address} after visiting {} blocks", .partial.links.len() + 1)]
    CircularReference { address: u64, partial: Box<Chain> },

    /// `partial` holds the head and every link read before the failure
    #[error("Chain scan stopped at link {address} after {} links", .partial.links.len())]
    PartialScan {
        address: u64,
        partial: Box<Chain>,
        #[source]
        source: Box<VaultError>,
    },

    #[error("Failed to open head block {address}")]
    Open {
        address: u64,
        #[source]
        source: Box<VaultError>,
    },

    #[error("Block {address} has type {found:?}, expected {expected:?}")]
    UnexpectedBlockType {
        address: u64,
        expected: BlockType,
        found: BlockType,
    },

    #[error("Invalid block type tag: {0}")]
    InvalidBlockType(u8),

    #[error("Invalid resource type: {0}")]
    InvalidResourceType(u8),

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),

    #[error("Index {index} out of bounds (len: {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Lease on address {address} was already revoked")]
    LeaseExpired { address: u64 },

    #[error("Bitmap I/O error on {}: {source}", .path.display())]
    BitmapIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed bitmap file: {0}")]
    BitmapFormat(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl VaultError {
    /// True for errors that signal on-disk corruption rather than misuse or I/O.
    pub fn is_corruption(&self) -> bool {
        match self {
            VaultError::Integrity { .. }
            | VaultError::CircularReference { .. }
            | VaultError::InvalidBlockType(_)
            | VaultError::InvalidResourceType(_)
            | VaultError::UnexpectedBlockType { .. } => true,
            VaultError::PartialScan { source, .. } | VaultError::Open { source, .. } => {
                source.is_corruption()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
