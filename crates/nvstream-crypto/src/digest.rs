//! Digest selection for the pairing handshake.
//!
//! Host generation 7 and later hash with SHA-256; older generations use
//! SHA-1. The hash also keys the challenge cipher: the AES key is the first
//! 16 bytes of hash(salt || pin).

use sha1::Sha1;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Pick the handshake hash for a host generation (major app version).
    pub fn for_server_generation(major_version: i32) -> Self {
        if major_version >= 7 {
            HashAlgorithm::Sha256
        } else {
            HashAlgorithm::Sha1
        }
    }

    /// Digest length in bytes: 32 for SHA-256, 20 for SHA-1.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hasher.finalize().to_vec()
            }
        }
    }

    /// Hash, then zero-pad or truncate to exactly 32 bytes. Stage 3 of the
    /// handshake encrypts a fixed 32-byte block regardless of digest size.
    pub fn hash_padded_32(&self, data: &[u8]) -> [u8; 32] {
        let digest = self.hash(data);
        let mut out = [0u8; 32];
        let n = digest.len().min(32);
        out[..n].copy_from_slice(&digest[..n]);
        out
    }
}

/// Derive the 16-byte pairing AES key from the random salt and the
/// user-entered PIN: hash(salt || pin)[0..16].
pub fn derive_pairing_key(algo: HashAlgorithm, salt: &[u8; 16], pin: &str) -> [u8; 16] {
    let mut salted = Vec::with_capacity(salt.len() + pin.len());
    salted.extend_from_slice(salt);
    salted.extend_from_slice(pin.as_bytes());

    let digest = algo.hash(&salted);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}
