#![no_main]
use arbitrary::Arbitrary;
use blockvault::{
    scan_chain, Block, BlockCipher, CipherKind, FileBlockMap, MemoryVolume, ResourceType,
    ScanMode, Volume,
};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
struct RawSegment {
    address: u8,
    head: bool,
    next: u8,
    addresses: Vec<u8>,
}

// Any wiring of next pointers, including cycles and dangling links, must
// terminate with a result or an error
fuzz_target!(|segments: Vec<RawSegment>| {
    let device = Arc::new(MemoryVolume::new(128).unwrap());
    let volume = Arc::new(Volume::new(
        device,
        BlockCipher::new(CipherKind::Aes256Gcm, [0x44; 32]),
    ));

    for segment in segments.iter().take(64) {
        let mut block = if segment.head {
            Block::head(128, ResourceType::File).unwrap()
        } else {
            Block::link(128).unwrap()
        };
        let addresses: Vec<u64> = segment.addresses.iter().take(8).map(|&a| a as u64).collect();
        block.set_addresses(&addresses).unwrap();
        block.set_next(Some(segment.next as u64).filter(|&next| next != 0));
        volume.write(segment.address as u64, block).unwrap();
    }

    for start in 0..=255u64 {
        let _ = scan_chain(&volume, start);
        if let Ok(lazy) = FileBlockMap::open(volume.clone(), start, ScanMode::Lazy) {
            let _ = lazy.data_addresses();
            let _ = lazy.address_at(100);
        }
    }
});
