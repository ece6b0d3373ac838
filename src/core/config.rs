//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty document is a
//! valid configuration:
//!
//! ```toml
//! block_size = 4096
//! address_size = 1048576
//! address_offset = 1
//! cache_capacity = 64
//! cipher = "aes256-gcm"
//!
//! [wheel]
//! interval_ms = 100
//! ```

use crate::block::validate_block_size;
use crate::encryption::CipherKind;
use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Time wheel parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelConfig {
    /// Width of one bucket in milliseconds
    pub interval_ms: u64,
    pub bucket_count: usize,
    /// Consecutive empty ticks before the idle hooks run
    pub idle_threshold: u32,
}

impl Default for WheelConfig {
    fn default() -> Self {
        WheelConfig {
            interval_ms: 100,
            bucket_count: 64,
            idle_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Physical block size in bytes
    pub block_size: usize,

    /// One past the highest usable block address
    pub address_size: u64,

    /// First usable block address; address 0 is reserved as the null `next`
    pub address_offset: u64,

    /// Addresses held by the allocator cache, also the replenish region width
    pub cache_capacity: usize,

    pub cipher: CipherKind,

    /// How long an allocator turn may be held before it is force-released
    pub turn_timeout_ms: u64,

    /// Link segments kept by lazily scanned file maps
    pub lazy_cache_segments: usize,

    /// Persist the bitmap each time the allocator goes idle
    pub flush_bitmap_on_idle: bool,

    pub wheel: WheelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            block_size: 4096,
            address_size: 1 << 20,
            address_offset: 1,
            cache_capacity: 64,
            cipher: CipherKind::Aes256Gcm,
            turn_timeout_ms: 5000,
            lazy_cache_segments: 32,
            flush_bitmap_on_idle: false,
            wheel: WheelConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        EngineConfig::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| VaultError::Config(e.to_string()))
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_address_range(mut self, size: u64, offset: u64) -> Self {
        self.address_size = size;
        self.address_offset = offset;
        self
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    pub fn with_cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    /// Check every field, naming the first offending one
    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size)
            .map_err(|_| VaultError::Config(format!(
                "block_size {} must be a multiple of 8 and at least 128",
                self.block_size
            )))?;

        if self.address_offset == 0 {
            return Err(VaultError::Config(
                "address_offset must be at least 1".to_string(),
            ));
        }
        if self.address_size <= self.address_offset {
            return Err(VaultError::Config(format!(
                "address_size {} must exceed address_offset {}",
                self.address_size, self.address_offset
            )));
        }
        if self.cache_capacity == 0 {
            return Err(VaultError::Config(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.turn_timeout_ms == 0 {
            return Err(VaultError::Config(
                "turn_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.lazy_cache_segments == 0 {
            return Err(VaultError::Config(
                "lazy_cache_segments must be at least 1".to_string(),
            ));
        }
        if self.wheel.interval_ms == 0 {
            return Err(VaultError::Config(
                "wheel.interval_ms must be at least 1".to_string(),
            ));
        }
        if self.wheel.bucket_count == 0 {
            return Err(VaultError::Config(
                "wheel.bucket_count must be at least 1".to_string(),
            ));
        }
        if self.wheel.idle_threshold == 0 {
            return Err(VaultError::Config(
                "wheel.idle_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() -> Result<()> {
        let config = EngineConfig::from_toml_str("")?;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cipher, CipherKind::Aes256Gcm);
        assert_eq!(config.turn_timeout(), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_partial_document() -> Result<()> {
        let config = EngineConfig::from_toml_str(
            r#"
            block_size = 512
            cipher = "none"

            [wheel]
            interval_ms = 20
            "#,
        )?;

        assert_eq!(config.block_size, 512);
        assert_eq!(config.cipher, CipherKind::None);
        assert_eq!(config.wheel.interval_ms, 20);
        assert_eq!(config.wheel.bucket_count, 64);
        assert_eq!(config.cache_capacity, 64);
        Ok(())
    }

    #[test]
    fn test_toml_round_trip() -> Result<()> {
        let config = EngineConfig::default()
            .with_block_size(1024)
            .with_address_range(500, 2)
            .with_cache_capacity(16);
        let text = config.to_toml_string()?;
        assert_eq!(EngineConfig::from_toml_str(&text)?, config);
        Ok(())
    }

    #[test]
    fn test_validation_names_field() {
        let cases = [
            (EngineConfig::default().with_block_size(100), "block_size"),
            (EngineConfig::default().with_address_range(10, 0), "address_offset"),
            (EngineConfig::default().with_address_range(10, 10), "address_size"),
            (EngineConfig::default().with_cache_capacity(0), "cache_capacity"),
        ];

        for (config, field) in cases {
            match config.validate() {
                Err(VaultError::Config(message)) => {
                    assert!(message.contains(field), "{} not in {}", field, message)
                }
                other => panic!("expected config error for {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            EngineConfig::from_toml_str("block_size = \"big\""),
            Err(VaultError::ConfigParse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("cipher = \"rot13\""),
            Err(VaultError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "cache_capacity = 8\n")?;

        let config = EngineConfig::load(&path)?;
        assert_eq!(config.cache_capacity, 8);
        Ok(())
    }
}
