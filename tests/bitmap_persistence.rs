//! Persisted bitmap tests
//!
//! The bitmap file is sealed to the volume, so it cannot be read with another
//! key or swapped onto another volume.

use blockvault::{AddressSpace, Allocator, BlockCipher, CipherKind, VaultError};
use std::time::Duration;
use tempfile::TempDir;

fn cipher(key: u8) -> BlockCipher {
    BlockCipher::new(CipherKind::Aes256Gcm, [key; 32])
}

#[test]
fn test_save_and_reload_allocations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bitmap");
    let allocator = Allocator::new(
        AddressSpace::new(2048, 1, 64).unwrap(),
        Duration::from_secs(5),
    );

    let turn = allocator.turn();
    let owned = turn.alloc_many(100).unwrap();
    turn.free(owned[0]).unwrap();
    turn.end();

    allocator.save_bitmap(&path, &cipher(1), b"volume-a").unwrap();
    let reloaded = AddressSpace::load_bitmap(&path, &cipher(1), b"volume-a", 64).unwrap();

    assert!(!reloaded.is_taken(owned[0]).unwrap());
    for &address in &owned[1..] {
        assert!(reloaded.is_taken(address).unwrap());
    }
    // Addresses cached but never handed out are not persisted as taken
    assert_eq!(reloaded.map().count_free(), 2047 - 99);
}

#[test]
fn test_bitmap_bound_to_volume() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bitmap");
    let mut space = AddressSpace::new(128, 1, 8).unwrap();
    space.alloc().unwrap();
    space.save_bitmap(&path, &cipher(1), b"volume-a").unwrap();

    assert!(matches!(
        AddressSpace::load_bitmap(&path, &cipher(1), b"volume-b", 8),
        Err(VaultError::Integrity { .. })
    ));
    assert!(matches!(
        AddressSpace::load_bitmap(&path, &cipher(2), b"volume-a", 8),
        Err(VaultError::Integrity { .. })
    ));
}

#[test]
fn test_tampered_bitmap_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bitmap");
    let space = AddressSpace::new(128, 1, 8).unwrap();
    space.save_bitmap(&path, &cipher(1), b"volume-a").unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        AddressSpace::load_bitmap(&path, &cipher(1), b"volume-a", 8),
        Err(VaultError::Integrity { .. })
    ));
}

#[test]
fn test_unknown_version_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("volume.bitmap");
    let space = AddressSpace::new(128, 1, 8).unwrap();
    space.save_bitmap(&path, &cipher(1), b"v").unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[4] = 99;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        AddressSpace::load_bitmap(&path, &cipher(1), b"v", 8),
        Err(VaultError::BitmapFormat(_))
    ));
}

#[test]
fn test_save_into_missing_directory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing").join("volume.bitmap");
    let space = AddressSpace::new(128, 1, 8).unwrap();

    assert!(matches!(
        space.save_bitmap(&path, &cipher(1), b"v"),
        Err(VaultError::BitmapIo { .. })
    ));
}

#[test]
fn test_idle_hook_persists_bitmap() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idle.bitmap");
    let allocator = std::sync::Arc::new(Allocator::new(
        AddressSpace::new(256, 1, 16).unwrap(),
        Duration::from_secs(5),
    ));

    let weak = std::sync::Arc::downgrade(&allocator);
    let hook_path = path.clone();
    allocator.on_idle(move || {
        if let Some(allocator) = weak.upgrade() {
            allocator.save_bitmap(&hook_path, &cipher(3), b"idle").unwrap();
        }
    });

    let address = allocator.alloc().unwrap();
    let reloaded = AddressSpace::load_bitmap(&path, &cipher(3), b"idle", 16).unwrap();
    assert!(reloaded.is_taken(address).unwrap());
}
