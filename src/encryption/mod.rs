// Leaf-value encryption seam. The provider runs just before a value is
// written into a leaf entry and just after it is read back, so the index
// structures themselves never see plaintext layout differences.

use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{Result, StorageError};

pub trait EncryptionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through default.
pub struct NoEncryption;

impl EncryptionProvider for NoEncryption {
    fn name(&self) -> &'static str {
        "nothing"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

/// AES-256-GCM with a 12-byte counter nonce prepended to each payload.
/// The counter never repeats within one provider instance, which is what
/// GCM requires of a fixed key.
pub struct AesGcmEncryption {
    cipher: Aes256Gcm,
    nonce_counter: AtomicU64,
}

impl AesGcmEncryption {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce_counter: AtomicU64::new(1),
        }
    }

    fn next_nonce(&self) -> [u8; 12] {
        let counter = self.nonce_counter.fetch_add(1, Ordering::AcqRel);
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

impl EncryptionProvider for AesGcmEncryption {
    fn name(&self) -> &'static str {
        "aes/gcm"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StorageError::IoMessage("value encryption failed".into()))?;
        let mut payload = Vec::with_capacity(12 + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < 12 {
            return Err(StorageError::Corruption(
                "encrypted value shorter than its nonce".into(),
            ));
        }
        let (nonce, ciphertext) = payload.split_at(12);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StorageError::Corruption("value decryption failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_gcm_roundtrip() {
        let provider = AesGcmEncryption::new(&[7u8; 32]);
        let payload = provider.encrypt(b"secret value").unwrap();
        assert_ne!(&payload[12..], b"secret value");
        assert_eq!(provider.decrypt(&payload).unwrap(), b"secret value");
    }

    #[test]
    fn test_tampered_payload_is_corruption() {
        let provider = AesGcmEncryption::new(&[7u8; 32]);
        let mut payload = provider.encrypt(b"secret value").unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 1;
        assert!(matches!(
            provider.decrypt(&payload),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_nonces_do_not_repeat() {
        let provider = AesGcmEncryption::new(&[7u8; 32]);
        let a = provider.encrypt(b"x").unwrap();
        let b = provider.encrypt(b"x").unwrap();
        assert_ne!(a[..12], b[..12]);
    }
}
