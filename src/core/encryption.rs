//! AES-256-GCM encryption bound to block addresses
//!
//! Every block body is sealed with a key derived from the volume root key and
//! the address the block lives at:
//!
//! - Per-address key: `SHA-256(root_key || "blockvault/block" || address_le)`
//! - 96-bit random nonce per seal, stored in the clear block header
//! - 128-bit detached authentication tag, stored in the clear block header
//! - Ciphertext has exactly the body length (in-place, no expansion)
//!
//! A ciphertext moved to another address is opened with a different key and
//! different associated data, so authentication fails.
//!
//! Metadata that lives outside the block space (the persisted bitmap) goes
//! through [`seal_container`] / [`open_container`], which use the
//! `[nonce][ciphertext][tag]` framing.

use crate::error::{Result, VaultError};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, AeadInPlace, KeyInit, OsRng, Payload},
    aes::{self, cipher::BlockEncrypt, Aes256},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Encryption key (32 bytes for AES-256)
pub type EncryptionKey = [u8; 32];

/// Nonce size for AES-GCM (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Overhead added by container encryption (nonce + tag)
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

const BLOCK_KEY_DOMAIN: &[u8] = b"blockvault/block";
const BITMAP_KEY_DOMAIN: &[u8] = b"blockvault/bitmap";

/// Cipher applied to block bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    /// Bodies stored in the clear; only the checksum binds them to their address
    None,
    /// AES-256-GCM with a per-address key
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
}

impl Default for CipherKind {
    fn default() -> Self {
        CipherKind::Aes256Gcm
    }
}

/// Nonce and tag produced by sealing one block body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SealParams {
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

/// Volume cipher: root key plus cipher choice
#[derive(Clone)]
pub struct BlockCipher {
    kind: CipherKind,
    root_key: EncryptionKey,
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl BlockCipher {
    /// Create a cipher with the given root key
    pub fn new(kind: CipherKind, root_key: EncryptionKey) -> Self {
        BlockCipher { kind, root_key }
    }

    /// Cipher that leaves bodies in the clear
    pub fn plaintext() -> Self {
        BlockCipher {
            kind: CipherKind::None,
            root_key: [0u8; 32],
        }
    }

    /// Generate a random root key
    pub fn generate_key() -> EncryptionKey {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != CipherKind::None
    }

    fn derive_key(&self, domain: &[u8], context: &[u8]) -> EncryptionKey {
        let mut hasher = Sha256::new();
        hasher.update(self.root_key);
        hasher.update(domain);
        hasher.update(context);
        hasher.finalize().into()
    }

    fn address_key(&self, address: u64) -> EncryptionKey {
        self.derive_key(BLOCK_KEY_DOMAIN, &address.to_le_bytes())
    }

    /// Key used for the persisted bitmap container
    pub fn bitmap_key(&self) -> EncryptionKey {
        self.derive_key(BITMAP_KEY_DOMAIN, &[])
    }

    /// Encrypt `body` in place for `address`
    ///
    /// `aad` is authenticated but not encrypted. Returns the nonce and tag the
    /// caller must store next to the ciphertext.
    pub fn seal(&self, address: u64, aad: &[u8], body: &mut [u8]) -> Result<SealParams> {
        if !self.is_enabled() {
            return Ok(SealParams::default());
        }

        let key = self.address_key(address);
        let cipher = Aes256Gcm::new((&key).into());

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, body)
            .map_err(|e| VaultError::Crypto(format!("Block encryption failed: {}", e)))?;

        let mut params = SealParams {
            nonce,
            tag: [0u8; TAG_SIZE],
        };
        params.tag.copy_from_slice(tag.as_slice());
        Ok(params)
    }

    /// Decrypt `body` in place, verifying the tag
    ///
    /// On failure the body is left untouched and an integrity error is returned.
    pub fn open(&self, address: u64, aad: &[u8], body: &mut [u8], params: &SealParams) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let key = self.address_key(address);
        let cipher = Aes256Gcm::new((&key).into());

        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&params.nonce),
                aad,
                body,
                GenericArray::from_slice(&params.tag),
            )
            .map_err(|_| VaultError::Integrity {
                address,
                reason: "authentication tag mismatch",
            })
    }

    /// Decrypt `body` in place without authenticating it
    ///
    /// Applies the GCM counter-mode keystream directly. Only meant for recovery
    /// tooling reading blocks whose tag no longer verifies.
    pub fn open_unverified(&self, address: u64, body: &mut [u8], params: &SealParams) {
        if !self.is_enabled() {
            return;
        }

        let key = self.address_key(address);
        let cipher = Aes256::new((&key).into());

        // GCM reserves counter 1 for the tag; the payload keystream starts at 2.
        for (i, chunk) in body.chunks_mut(16).enumerate() {
            let counter = 2u32.wrapping_add(i as u32);
            let mut block = aes::Block::default();
            block[..NONCE_SIZE].copy_from_slice(&params.nonce);
            block[NONCE_SIZE..].copy_from_slice(&counter.to_be_bytes());
            cipher.encrypt_block(&mut block);
            for (byte, k) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= k;
            }
        }
    }
}

/// Encrypt a standalone payload using AES-256-GCM
///
/// Returns encrypted data with format: [nonce][ciphertext][tag]
pub fn seal_container(data: &[u8], key: &EncryptionKey, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: data, aad })
        .map_err(|e| VaultError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt a payload produced by [`seal_container`]
///
/// A wrong key, wrong `aad` or tampered bytes all fail with `Integrity`.
pub fn open_container(data: &[u8], key: &EncryptionKey, aad: &[u8]) -> Result<Vec<u8>> {
    if data.len() < ENCRYPTION_OVERHEAD {
        return Err(VaultError::Crypto("Encrypted data too short".to_string()));
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
    let ciphertext = &data[NONCE_SIZE..];

    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| VaultError::Integrity {
            address: 0,
            reason: "container authentication failed",
        })
}
