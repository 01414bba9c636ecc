//! At-rest encryption of server-authored blobs under a per-study key.
//!
//! Stored blob format (binary):
//! ```text
//! [16 bytes: random IV][N bytes: AES-256-CFB8 ciphertext]
//! ```
//!
//! CFB8 is a stream mode, so the ciphertext is exactly as long as the
//! plaintext and no padding is involved.

use aes::Aes256;
use cfb8::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::{CryptoRng, RngCore};
use thiserror::Error;
use zeroize::Zeroize;

use crate::{IV_SIZE, STUDY_KEY_SIZE};

type Cfb8Enc = cfb8::Encryptor<Aes256>;
type Cfb8Dec = cfb8::Decryptor<Aes256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageCipherError {
    #[error("study key must be {STUDY_KEY_SIZE} bytes, got {0}")]
    KeyLength(usize),

    #[error("stored blob too short: {0} bytes (minimum {IV_SIZE})")]
    Truncated(usize),
}

/// A study's 256-bit at-rest encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct StudyKey {
    bytes: [u8; STUDY_KEY_SIZE],
}

impl StudyKey {
    pub fn from_bytes(bytes: [u8; STUDY_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, StorageCipherError> {
        let bytes: [u8; STUDY_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| StorageCipherError::KeyLength(bytes.len()))?;
        Ok(Self { bytes })
    }

    /// Generate a fresh random study key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; STUDY_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; STUDY_KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for StudyKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for StudyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudyKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt a blob for storage with a freshly drawn IV.
///
/// Returns `[16-byte IV][ciphertext]`.
pub fn encrypt_for_storage<R: RngCore + CryptoRng>(
    rng: &mut R,
    key: &StudyKey,
    plaintext: &[u8],
) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    rng.fill_bytes(&mut iv);

    let mut result = Vec::with_capacity(IV_SIZE + plaintext.len());
    result.extend_from_slice(&iv);
    result.extend_from_slice(plaintext);

    Cfb8Enc::new(key.as_bytes().into(), &iv.into()).encrypt(&mut result[IV_SIZE..]);
    result
}

/// Decrypt a blob written by [`encrypt_for_storage`].
pub fn decrypt_from_storage(key: &StudyKey, blob: &[u8]) -> Result<Vec<u8>, StorageCipherError> {
    if blob.len() < IV_SIZE {
        return Err(StorageCipherError::Truncated(blob.len()));
    }

    let (iv, ciphertext) = blob.split_at(IV_SIZE);
    let mut plaintext = ciphertext.to_vec();
    Cfb8Dec::new(key.as_bytes().into(), iv.into()).decrypt(&mut plaintext);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_key() -> StudyKey {
        StudyKey::from_bytes([7u8; STUDY_KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut rng = StdRng::seed_from_u64(1);
        let key = test_key();
        let blob = encrypt_for_storage(&mut rng, &key, b"timestamp,latitude\n1,2\n");
        let plain = decrypt_from_storage(&key, &blob).unwrap();
        assert_eq!(plain, b"timestamp,latitude\n1,2\n");
    }

    #[test]
    fn test_encrypted_size() {
        let mut rng = StdRng::seed_from_u64(2);
        let blob = encrypt_for_storage(&mut rng, &test_key(), &[0u8; 1000]);
        // iv (16) + plaintext (1000), no padding in CFB8
        assert_eq!(blob.len(), IV_SIZE + 1000);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let mut rng = StdRng::seed_from_u64(3);
        let key = test_key();
        let a = encrypt_for_storage(&mut rng, &key, b"same input");
        let b = encrypt_for_storage(&mut rng, &key, b"same input");
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE], "IVs must not repeat");
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_yields_garbage() {
        let mut rng = StdRng::seed_from_u64(4);
        let blob = encrypt_for_storage(&mut rng, &test_key(), b"secret survey answer");
        let other = StudyKey::from_bytes([8u8; STUDY_KEY_SIZE]);
        let plain = decrypt_from_storage(&other, &blob).unwrap();
        assert_ne!(plain, b"secret survey answer");
    }

    #[test]
    fn test_truncated_blob() {
        let err = decrypt_from_storage(&test_key(), &[0u8; 15]).unwrap_err();
        assert_eq!(err, StorageCipherError::Truncated(15));
    }

    #[test]
    fn test_iv_only_blob_is_empty_plaintext() {
        let plain = decrypt_from_storage(&test_key(), &[0u8; IV_SIZE]).unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn test_key_from_slice_length() {
        assert!(StudyKey::from_slice(&[1u8; 32]).is_ok());
        assert_eq!(
            StudyKey::from_slice(&[1u8; 16]).unwrap_err(),
            StorageCipherError::KeyLength(16)
        );
    }

    #[test]
    fn test_debug_is_redacted() {
        let rendered = format!("{:?}", test_key());
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains('7'));
    }

    proptest! {
        #[test]
        fn roundtrip_any_bytes(
            data in proptest::collection::vec(any::<u8>(), 0..=2048),
            key in any::<[u8; 32]>(),
            seed in any::<u64>(),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let key = StudyKey::from_bytes(key);
            let blob = encrypt_for_storage(&mut rng, &key, &data);
            prop_assert_eq!(decrypt_from_storage(&key, &blob).unwrap(), data);
        }
    }
}
