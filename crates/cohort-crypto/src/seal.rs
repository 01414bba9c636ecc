//! Device-side upload encoding.
//!
//! Produces files in the exact format the mobile apps upload, so the server
//! path can be exercised end to end:
//! ```text
//! base64( RSA( base64(file_key) ) )          <- envelope, line 0
//! base64(iv):base64( AES-CBC-PKCS7(line) )   <- one per data line
//! ```

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::base64::encode_base64;
use crate::keys::StudyPublicKey;
use crate::IV_SIZE;

/// Symmetric key size devices use for file keys (AES-128)
pub const DEVICE_KEY_SIZE: usize = 16;

/// Holds one file's symmetric key and seals lines under it.
pub struct DeviceSealer {
    key: Zeroizing<Vec<u8>>,
}

impl DeviceSealer {
    /// Draw a fresh AES-128 file key.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = vec![0u8; DEVICE_KEY_SIZE];
        rng.fill_bytes(&mut key);
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Use a caller-supplied key (any length; sealing lines needs 16, 24 or 32).
    pub fn with_key(key: Vec<u8>) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Build the envelope line: the file key, base64 encoded, wrapped by RSA,
    /// base64 encoded again.
    pub fn envelope<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        public: &StudyPublicKey,
    ) -> anyhow::Result<String> {
        let inner = encode_base64(&self.key);
        let wrapped = public.wrap(rng, inner.as_bytes())?;
        Ok(encode_base64(&wrapped))
    }

    /// Seal one plaintext line as `base64(iv):base64(ciphertext)`.
    pub fn seal_line<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
    ) -> anyhow::Result<String> {
        let mut iv = [0u8; IV_SIZE];
        rng.fill_bytes(&mut iv);
        let ciphertext = cbc_encrypt(&self.key, &iv, plaintext)?;
        Ok(format!("{}:{}", encode_base64(&iv), encode_base64(&ciphertext)))
    }
}

/// Seal a whole file: envelope followed by one sealed line per input line.
pub fn seal_file<R: RngCore + CryptoRng>(
    rng: &mut R,
    public: &StudyPublicKey,
    lines: &[&[u8]],
) -> anyhow::Result<Vec<u8>> {
    let sealer = DeviceSealer::new(rng);
    let mut out = sealer.envelope(rng, public)?.into_bytes();
    for line in lines {
        out.push(b'\n');
        out.extend_from_slice(sealer.seal_line(rng, line)?.as_bytes());
    }
    out.push(b'\n');
    Ok(out)
}

fn cbc_encrypt(key: &[u8], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let invalid = |e: cbc::cipher::InvalidLength| {
        anyhow::anyhow!("invalid AES key length {}: {e}", key.len())
    };
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n => anyhow::bail!("invalid AES key length {n}"),
    };
    Ok(ciphertext)
}
