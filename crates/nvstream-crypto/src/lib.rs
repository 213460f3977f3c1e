//! # nvstream-crypto
//!
//! The crypto capability for the nvstream client: AES-128-ECB for the
//! pairing challenge cipher, SHA-1/SHA-256 digests, RSA-SHA256 signing and
//! verification against X.509 material, and the long-lived client identity
//! (keypair + self-signed certificate).
//!
//! Protocol code never touches a cipher or certificate library directly;
//! everything goes through this crate.

pub mod aes_ecb;
pub mod digest;
pub mod identity;
pub mod pem;

pub use aes_ecb::Aes128EcbCipher;
pub use digest::{derive_pairing_key, HashAlgorithm};
pub use identity::ClientIdentity;
pub use pem::{certificate_signature_bytes, pem_to_der, verify_rsa_sha256};

/// Cryptographically strong random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_are_fresh() {
        let a = random_bytes(16);
        let b = random_bytes(16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
