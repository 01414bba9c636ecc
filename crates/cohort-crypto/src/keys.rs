//! Study key pairings: RSA keys that wrap the per-file symmetric key.
//!
//! The public half goes to devices as a bare base64 body (PEM armor removed,
//! which is what the device key loaders accept); the private half stays on the
//! server and unwraps the envelope line of every upload.

use rand::{CryptoRng, RngCore};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

/// A freshly issued key pairing, both halves PEM encoded.
#[derive(Clone)]
pub struct KeyPairing {
    /// SubjectPublicKeyInfo PEM
    pub public_pem: String,
    /// PKCS#8 PEM
    pub private_pem: String,
}

impl std::fmt::Debug for KeyPairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairing")
            .field("public_pem", &self.public_pem)
            .field("private_pem", &"[REDACTED]")
            .finish()
    }
}

/// Generate a new RSA key pairing of `bits` modulus size.
pub fn generate_key_pairing<R: RngCore + CryptoRng>(
    rng: &mut R,
    bits: usize,
) -> anyhow::Result<KeyPairing> {
    let private = RsaPrivateKey::new(rng, bits)
        .map_err(|e| anyhow::anyhow!("RSA key generation failed: {e}"))?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("encoding private key: {e}"))?
        .to_string();
    let public_pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("encoding public key: {e}"))?;

    Ok(KeyPairing {
        public_pem,
        private_pem,
    })
}

/// Strip the PEM armor and line breaks from a public key for devices.
pub fn public_key_for_device(public_pem: &str) -> String {
    public_pem
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("-----"))
        .collect()
}

/// Server-held private key used to unwrap upload envelopes.
#[derive(Clone)]
pub struct StudyPrivateKey {
    inner: RsaPrivateKey,
}

impl StudyPrivateKey {
    /// Load from PEM; PKCS#8 and PKCS#1 encodings are both accepted.
    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| anyhow::anyhow!("invalid RSA private key PEM: {e}"))?;
        Ok(Self { inner })
    }

    pub fn public_key(&self) -> StudyPublicKey {
        StudyPublicKey {
            inner: RsaPublicKey::from(&self.inner),
        }
    }

    /// Decrypt an envelope blob (PKCS#1 v1.5).
    pub fn unwrap_envelope(&self, wrapped: &[u8]) -> Result<Vec<u8>, rsa::Error> {
        self.inner.decrypt(Pkcs1v15Encrypt, wrapped)
    }
}

impl std::fmt::Debug for StudyPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StudyPrivateKey([REDACTED])")
    }
}

/// Device-side half of a pairing.
#[derive(Debug, Clone)]
pub struct StudyPublicKey {
    inner: RsaPublicKey,
}

impl StudyPublicKey {
    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let inner = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| anyhow::anyhow!("invalid RSA public key PEM: {e}"))?;
        Ok(Self { inner })
    }

    /// Encrypt a short payload (PKCS#1 v1.5), as a device does with its file key.
    pub fn wrap<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        data: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        self.inner
            .encrypt(rng, Pkcs1v15Encrypt, data)
            .map_err(|e| anyhow::anyhow!("envelope wrapping failed: {e}"))
    }
}
