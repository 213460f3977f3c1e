//! AES-128-ECB for the pairing challenge cipher.
//!
//! ECB with no padding is mandated by the host pairing protocol; inputs are
//! always hash-sized multiples of the block length.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use nvstream_core::CryptoError;
use zeroize::ZeroizeOnDrop;

/// AES-128-ECB cipher keyed with the salted-PIN hash.
#[derive(ZeroizeOnDrop)]
pub struct Aes128EcbCipher {
    key: [u8; 16],
}

impl Aes128EcbCipher {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Encrypt plaintext (must be a multiple of 16 bytes). No padding.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() % 16 != 0 {
            return Err(CryptoError::Encryption(
                "Plaintext must be a multiple of 16 bytes".to_string(),
            ));
        }

        let cipher = Aes128::new_from_slice(&self.key)
            .map_err(|e| CryptoError::Encryption(format!("Invalid key: {}", e)))?;

        let mut ciphertext = plaintext.to_vec();
        for chunk in ciphertext.chunks_mut(16) {
            let block = aes::Block::from_mut_slice(chunk);
            cipher.encrypt_block(block);
        }

        Ok(ciphertext)
    }

    /// Decrypt ciphertext (must be a multiple of 16 bytes). No padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() % 16 != 0 {
            return Err(CryptoError::Decryption(
                "Ciphertext must be a multiple of 16 bytes".to_string(),
            ));
        }

        let cipher = Aes128::new_from_slice(&self.key)
            .map_err(|e| CryptoError::Decryption(format!("Invalid key: {}", e)))?;

        let mut plaintext = ciphertext.to_vec();
        for chunk in plaintext.chunks_mut(16) {
            let block = aes::Block::from_mut_slice(chunk);
            cipher.decrypt_block(block);
        }

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_requires_block_aligned_input() {
        let cipher = Aes128EcbCipher::new([0u8; 16]);

        assert!(cipher.encrypt(&[0u8; 16]).is_ok());
        assert!(cipher.encrypt(&[0u8; 32]).is_ok());
        assert!(cipher.encrypt(&[0u8; 15]).is_err());
        assert!(cipher.encrypt(&[0u8; 17]).is_err());
    }

    #[test]
    fn decrypt_requires_block_aligned_input() {
        let cipher = Aes128EcbCipher::new([0u8; 16]);

        assert!(cipher.decrypt(&[0u8; 16]).is_ok());
        assert!(cipher.decrypt(&[0u8; 20]).is_err());
    }

    #[test]
    fn decrypt_roundtrip() {
        let cipher = Aes128EcbCipher::new([0x42u8; 16]);

        let plaintext = [0xABu8; 48];
        let ciphertext = cipher.encrypt(&plaintext).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);

        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn identical_blocks_encrypt_identically() {
        // The defining (and protocol-mandated) ECB property.
        let cipher = Aes128EcbCipher::new([0x42u8; 16]);
        let ciphertext = cipher.encrypt(&[0xCDu8; 32]).unwrap();
        assert_eq!(&ciphertext[..16], &ciphertext[16..]);
    }

    #[test]
    fn nist_test_vector() {
        // NIST SP 800-38A - F.1.1 ECB-AES128.Encrypt
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let expected = hex::decode("3ad77bb40d7a3660a89ecaf32466ef97").unwrap();

        let mut key_arr = [0u8; 16];
        key_arr.copy_from_slice(&key);

        let cipher = Aes128EcbCipher::new(key_arr);
        let ciphertext = cipher.encrypt(&plaintext).unwrap();
        assert_eq!(ciphertext, expected);

        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
