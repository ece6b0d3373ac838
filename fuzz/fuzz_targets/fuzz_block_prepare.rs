#![no_main]
use blockvault::{BlockCipher, CipherKind, SealedBlock};
use libfuzzer_sys::fuzz_target;

// Arbitrary device bytes must never panic the decoder, with or without
// integrity checks
fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    let address = u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]);

    for cipher in [
        BlockCipher::new(CipherKind::Aes256Gcm, [0x33; 32]),
        BlockCipher::plaintext(),
    ] {
        for check_integrity in [true, false] {
            let sealed = match SealedBlock::from_bytes(data[8..].to_vec()) {
                Ok(sealed) => sealed,
                Err(_) => return,
            };
            if let Ok(block) = sealed.prepare(address, &cipher, check_integrity) {
                let _ = block.addresses();
                let _ = block.next();
                let _ = block.resource_type();
                let _ = block.body();
            }
        }
    }
});
