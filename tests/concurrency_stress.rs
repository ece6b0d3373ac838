//! Concurrent allocator and file map stress tests

use blockvault::{
    AddressSpace, Allocator, BlockCipher, CipherKind, FileBlockMap, MemoryVolume, ResourceType,
    ScanMode, Volume,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn shared_allocator(size: u64, timeout: Duration) -> Arc<Allocator> {
    Arc::new(Allocator::new(AddressSpace::new(size, 1, 32).unwrap(), timeout))
}

#[test]
fn test_8_writers_never_share_blocks() {
    let device = Arc::new(MemoryVolume::new(256).unwrap());
    let volume = Arc::new(Volume::new(
        device,
        BlockCipher::new(CipherKind::Aes256Gcm, [0x77; 32]),
    ));
    let allocator = shared_allocator(8192, Duration::from_secs(5));

    let handles: Vec<_> = (0..8)
        .map(|thread_id| {
            let volume = Arc::clone(&volume);
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                let mut file =
                    FileBlockMap::create(volume, &allocator, ResourceType::File, ScanMode::Eager)
                        .unwrap();
                for i in 0..120u32 {
                    let payload = format!("t{}-{}", thread_id, i);
                    file.append_data(&allocator, payload.as_bytes()).unwrap();
                }
                file
            })
        })
        .collect();

    let files: Vec<FileBlockMap> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut owned = HashSet::new();
    for file in &files {
        let blocks = std::iter::once(file.head_address())
            .chain(file.link_addresses().unwrap())
            .chain(file.data_addresses().unwrap());
        for address in blocks {
            assert!(owned.insert(address), "Block {} owned by two files!", address);
            assert!(allocator.is_taken(address).unwrap());
        }
    }

    for (thread_id, file) in files.iter().enumerate() {
        assert_eq!(file.len().unwrap(), 120);
        assert_eq!(
            file.read_data(119).unwrap(),
            format!("t{}-119", thread_id).into_bytes()
        );
    }
}

#[test]
fn test_turns_are_exclusive() {
    let allocator = shared_allocator(4096, Duration::from_secs(5));
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            thread::spawn(move || {
                for _ in 0..50 {
                    let turn = allocator.turn();
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    let addresses = turn.alloc_many(3).unwrap();
                    for address in addresses {
                        turn.free(address).unwrap();
                    }
                    inside.fetch_sub(1, Ordering::SeqCst);
                    turn.end();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(allocator.forced_releases(), 0);
}

#[test]
fn test_stuck_turn_does_not_stall_allocator() {
    let allocator = shared_allocator(1024, Duration::from_millis(30));
    let results = Arc::new(Mutex::new(Vec::new()));

    let stuck = allocator.turn();
    let started = Instant::now();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            let results = Arc::clone(&results);
            thread::spawn(move || {
                let address = allocator.alloc().unwrap();
                results.lock().push(address);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(started.elapsed() >= Duration::from_millis(25));
    assert_eq!(results.lock().len(), 4);
    assert_eq!(allocator.forced_releases(), 1);

    // The stuck holder finds its turn gone
    assert!(!stuck.is_current());
    assert!(!stuck.end());
}
