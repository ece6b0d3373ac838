//! Tests for chain scanning and file block maps

use super::*;
use crate::allocator::AddressSpace;
use crate::encryption::{BlockCipher, CipherKind};
use crate::io::{BlockDevice, MemoryVolume};
use std::time::Duration;

// 128-byte blocks hold 8 addresses per segment
const BLOCK_SIZE: usize = 128;

struct Fixture {
    device: Arc<MemoryVolume>,
    volume: Arc<Volume>,
    allocator: Allocator,
}

fn fixture() -> Fixture {
    let device = Arc::new(MemoryVolume::new(BLOCK_SIZE).unwrap());
    let cipher = BlockCipher::new(CipherKind::Aes256Gcm, [9u8; 32]);
    let volume = Arc::new(Volume::new(device.clone(), cipher));
    let space = AddressSpace::new(512, 1, 16).unwrap();
    Fixture {
        device,
        volume,
        allocator: Allocator::new(space, Duration::from_secs(5)),
    }
}

fn file_with(fx: &Fixture, count: usize, mode: ScanMode) -> (FileBlockMap, Vec<u64>) {
    let mut file =
        FileBlockMap::create(fx.volume.clone(), &fx.allocator, ResourceType::File, mode).unwrap();
    let mut data = Vec::new();
    for i in 0..count {
        data.push(file.append_data(&fx.allocator, format!("chunk {}", i).as_bytes()).unwrap());
    }
    (file, data)
}

fn write_segment(volume: &Volume, kind: BlockType, address: u64, addresses: &[u64], next: Option<u64>) {
    let mut block = match kind {
        BlockType::Head => Block::head(BLOCK_SIZE, ResourceType::File).unwrap(),
        _ => Block::link(BLOCK_SIZE).unwrap(),
    };
    block.set_addresses(addresses).unwrap();
    block.set_next(next);
    volume.write(address, block).unwrap();
}

#[test]
fn test_append_spans_links() {
    let fx = fixture();
    let (file, data) = file_with(&fx, 20, ScanMode::Eager);

    assert_eq!(file.len().unwrap(), 20);
    assert_eq!(file.data_addresses().unwrap(), data);
    assert_eq!(file.link_addresses().unwrap().len(), 2);
    assert_eq!(file.address_at(0).unwrap(), data[0]);
    assert_eq!(file.address_at(19).unwrap(), data[19]);

    assert!(matches!(
        file.address_at(20),
        Err(VaultError::IndexOutOfBounds { index: 20, len: 20 })
    ));
}

#[test]
fn test_reopen_modes_agree() {
    let fx = fixture();
    let (file, data) = file_with(&fx, 19, ScanMode::Lazy);
    let head = file.head_address();

    let eager = FileBlockMap::open(fx.volume.clone(), head, ScanMode::Eager).unwrap();
    let lazy = FileBlockMap::open(fx.volume.clone(), head, ScanMode::Lazy)
        .unwrap()
        .with_segment_cache(1);

    assert_eq!(eager.data_addresses().unwrap(), data);
    assert_eq!(lazy.data_addresses().unwrap(), data);
    assert_eq!(lazy.address_at(17).unwrap(), data[17]);
    assert_eq!(lazy.address_at(3).unwrap(), data[3]);
    assert_eq!(lazy.read_data(10).unwrap(), b"chunk 10".to_vec());
}

#[test]
fn test_append_existing_address() {
    let fx = fixture();
    let mut file =
        FileBlockMap::create(fx.volume.clone(), &fx.allocator, ResourceType::File, ScanMode::Eager)
            .unwrap();

    let address = fx.allocator.alloc().unwrap();
    fx.volume
        .write(address, Block::data(BLOCK_SIZE, b"external").unwrap())
        .unwrap();
    file.append(&fx.allocator, address).unwrap();

    assert_eq!(file.read_data(0).unwrap(), b"external".to_vec());
}

#[test]
fn test_metadata() {
    let fx = fixture();
    let file = FileBlockMap::create(
        fx.volume.clone(),
        &fx.allocator,
        ResourceType::Directory,
        ScanMode::Eager,
    )
    .unwrap();

    assert_eq!(file.resource_type().unwrap(), ResourceType::Directory);
    assert!(file.created() > 0);
    assert!(file.modified() >= file.created());
    assert!(file.is_empty().unwrap());
    assert_eq!(file.mode(), ScanMode::Eager);
}

#[test]
fn test_cycle_detected() {
    let fx = fixture();
    let (head, a, b) = (10, 11, 12);
    write_segment(&fx.volume, BlockType::Head, head, &[100, 101], Some(a));
    write_segment(&fx.volume, BlockType::Link, a, &[102], Some(b));
    write_segment(&fx.volume, BlockType::Link, b, &[103], Some(a));

    match scan_chain(&fx.volume, head) {
        Err(VaultError::CircularReference { address, partial }) => {
            assert_eq!(address, a);
            assert_eq!(partial.block_addresses(), vec![head, a, b]);
            assert_eq!(partial.data_addresses(), vec![100, 101, 102, 103]);
        }
        other => panic!("expected circular reference, got {:?}", other),
    }

    match FileBlockMap::open(fx.volume.clone(), head, ScanMode::Eager) {
        Err(VaultError::Open { address, source }) => {
            assert_eq!(address, head);
            assert!(matches!(*source, VaultError::CircularReference { .. }));
        }
        other => panic!("expected open error, got {:?}", other.err()),
    }

    // A lazy map only trips over the cycle when a lookup walks into it
    let lazy = FileBlockMap::open(fx.volume.clone(), head, ScanMode::Lazy).unwrap();
    assert_eq!(lazy.address_at(1).unwrap(), 101);
    assert_eq!(lazy.address_at(3).unwrap(), 103);
    match lazy.address_at(4) {
        Err(VaultError::CircularReference { address, partial }) => {
            assert_eq!(address, a);
            assert_eq!(partial.len(), 4);
        }
        other => panic!("expected circular reference, got {:?}", other),
    }
}

#[test]
fn test_self_referencing_head() {
    let fx = fixture();
    write_segment(&fx.volume, BlockType::Head, 20, &[], Some(20));

    assert!(matches!(
        scan_chain(&fx.volume, 20),
        Err(VaultError::CircularReference { address: 20, .. })
    ));
}

#[test]
fn test_partial_scan_keeps_progress() {
    let fx = fixture();
    let (head, a, b) = (30, 31, 32);
    write_segment(&fx.volume, BlockType::Head, head, &[1], Some(a));
    write_segment(&fx.volume, BlockType::Link, a, &[2], Some(b));
    write_segment(&fx.volume, BlockType::Link, b, &[3], None);

    fx.device.with_raw_mut(b, |bytes| bytes[100] ^= 0x01);

    match scan_chain(&fx.volume, head) {
        Err(VaultError::PartialScan {
            address,
            partial,
            source,
        }) => {
            assert_eq!(address, b);
            assert_eq!(partial.block_addresses(), vec![head, a]);
            assert_eq!(partial.data_addresses(), vec![1, 2]);
            assert!(source.is_corruption());
        }
        other => panic!("expected partial scan, got {:?}", other),
    }
}

#[test]
fn test_open_rejects_non_head() {
    let fx = fixture();
    write_segment(&fx.volume, BlockType::Link, 40, &[], None);

    match FileBlockMap::open(fx.volume.clone(), 40, ScanMode::Lazy) {
        Err(VaultError::Open { source, .. }) => {
            assert!(matches!(
                *source,
                VaultError::UnexpectedBlockType {
                    expected: BlockType::Head,
                    found: BlockType::Link,
                    ..
                }
            ));
        }
        other => panic!("expected open error, got {:?}", other.err()),
    }

    // Never-written space has no valid type tag
    assert!(matches!(
        FileBlockMap::open(fx.volume.clone(), 41, ScanMode::Eager),
        Err(VaultError::Open { address: 41, .. })
    ));
}

#[test]
fn test_truncate_keeps_head_address() {
    let fx = fixture();
    let (mut file, data) = file_with(&fx, 12, ScanMode::Eager);
    let head = file.head_address();
    let links = file.link_addresses().unwrap();
    assert_eq!(links.len(), 1);

    let freed = file.truncate(&fx.allocator).unwrap();
    assert_eq!(freed.len(), 13);
    assert_eq!(&freed[..12], &data[..]);
    assert_eq!(freed[12], links[0]);

    assert_eq!(file.head_address(), head);
    assert!(fx.allocator.is_taken(head).unwrap());
    for address in &freed {
        assert!(!fx.allocator.is_taken(*address).unwrap());
    }

    assert_eq!(file.len().unwrap(), 0);
    let reopened = FileBlockMap::open(fx.volume.clone(), head, ScanMode::Eager).unwrap();
    assert_eq!(reopened.len().unwrap(), 0);

    // The truncated file is still usable
    file.append_data(&fx.allocator, b"again").unwrap();
    assert_eq!(file.read_data(0).unwrap(), b"again".to_vec());
}

#[test]
fn test_truncate_zeroes_freed_blocks() {
    let fx = fixture();
    let (mut file, _) = file_with(&fx, 10, ScanMode::Eager);

    for address in file.truncate(&fx.allocator).unwrap() {
        assert!(fx.volume.read_if_written(address).unwrap().is_none());
    }
    assert!(fx.volume.read_if_written(file.head_address()).unwrap().is_some());
}

#[test]
fn test_lazy_truncate() {
    let fx = fixture();
    let (mut file, _) = file_with(&fx, 9, ScanMode::Lazy);
    assert_eq!(file.truncate(&fx.allocator).unwrap().len(), 10);
    assert!(file.is_empty().unwrap());
}

#[test]
fn test_rebuild_address_space() {
    let fx = fixture();
    let (first, _) = file_with(&fx, 10, ScanMode::Eager);
    let (second, _) = file_with(&fx, 3, ScanMode::Eager);

    let roots = [first.head_address(), second.head_address()];
    let space = rebuild_address_space(&fx.volume, 512, 1, 16, &roots).unwrap();

    let mut expected = 0;
    for file in [&first, &second] {
        let reachable = std::iter::once(file.head_address())
            .chain(file.link_addresses().unwrap())
            .chain(file.data_addresses().unwrap());
        for address in reachable {
            assert!(space.is_taken(address).unwrap());
            expected += 1;
        }
    }
    assert_eq!(space.map().count_free(), 511 - expected);
}

#[test]
fn test_scan_address_space_finds_live_blocks() {
    let fx = fixture();
    let (first, _) = file_with(&fx, 10, ScanMode::Eager);
    let (mut second, _) = file_with(&fx, 4, ScanMode::Eager);
    let freed = second.truncate(&fx.allocator).unwrap();

    // Garbage in a block nobody tracks is kept rather than reused
    fx.device.with_raw_mut(200, |bytes| bytes[70] = 0xAB);
    // A head pointing past the end of the device still reserves its targets
    write_segment(&fx.volume, BlockType::Head, 300, &[450, 9_999], None);

    let space = scan_address_space(&fx.volume, 512, 1, 16).unwrap();

    let live = std::iter::once(first.head_address())
        .chain(first.link_addresses().unwrap())
        .chain(first.data_addresses().unwrap());
    for address in live {
        assert!(space.is_taken(address).unwrap());
    }
    assert!(space.is_taken(second.head_address()).unwrap());
    for address in freed {
        assert!(!space.is_taken(address).unwrap());
    }
    assert!(space.is_taken(200).unwrap());
    assert!(space.is_taken(300).unwrap());
    assert!(space.is_taken(450).unwrap());
    assert!(!space.is_taken(451).unwrap());

    // first: head + 1 link + 10 data, second: head, then 200, 300 and 450
    assert_eq!(space.count_free(), 511 - 12 - 1 - 3);
}

#[test]
fn test_scan_address_space_keeps_damaged_chain_prefix() {
    let fx = fixture();
    let (head, a, b) = (60, 61, 62);
    write_segment(&fx.volume, BlockType::Head, head, &[400, 401], Some(a));
    write_segment(&fx.volume, BlockType::Link, a, &[402], Some(b));
    write_segment(&fx.volume, BlockType::Link, b, &[403], Some(a));

    let space = scan_address_space(&fx.volume, 512, 1, 16).unwrap();
    for address in [head, a, b, 400, 401, 402, 403] {
        assert!(space.is_taken(address).unwrap());
    }
}

#[test]
fn test_scan_empty_device() {
    let fx = fixture();
    let space = scan_address_space(&fx.volume, 512, 1, 16).unwrap();
    assert_eq!(space.count_free(), 511);
}

#[test]
fn test_chain_accessors() {
    let fx = fixture();
    let (file, data) = file_with(&fx, 17, ScanMode::Eager);

    let chain = scan_chain(&fx.volume, file.head_address()).unwrap();
    assert_eq!(chain.len(), 17);
    assert!(!chain.is_empty());
    assert_eq!(chain.data_addresses(), data);
    assert_eq!(chain.block_addresses().len(), 3);
    assert_eq!(chain.block_addresses()[0], file.head_address());

    // Blocks written by the map are sealed for their own address
    let raw = fx.device.read_block(file.head_address()).unwrap();
    assert_eq!(raw[0], BlockType::Head as u8);
}
