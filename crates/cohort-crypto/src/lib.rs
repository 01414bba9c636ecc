//! cohort-crypto: device-upload decryption and at-rest encryption
//!
//! Upload format (one file, newline separated):
//! ```text
//! line 0:  base64( RSA-PKCS1v15( base64(file_key) ) )
//! line n:  base64(iv) ":" base64( AES-CBC(file_key, iv, PKCS5(data)) )
//! ```
//!
//! Decrypted data is re-encrypted for storage under a per-study key with
//! AES-256-CFB8 and a fresh IV per blob.

pub mod base64;
pub mod cipher;
pub mod diagnostics;
pub mod error;
pub mod file;
pub mod keys;
pub mod line;
pub mod seal;

pub use base64::{decode_base64, encode_base64, Base64Error};
pub use cipher::{decrypt_from_storage, encrypt_for_storage, StorageCipherError, StudyKey};
pub use diagnostics::{
    DiagnosticRecord, DiagnosticSink, JsonlSink, MemorySink, NullSink, TracingSink,
};
pub use error::{FileDecryptError, KeyError, LineError, LineErrorKind, LineFailure};
pub use file::{decrypt_device_file, DiagnosticContext, FileDecryption};
pub use keys::{
    generate_key_pairing, public_key_for_device, KeyPairing, StudyPrivateKey, StudyPublicKey,
};
pub use line::decrypt_device_line;
pub use seal::{seal_file, DeviceSealer};

/// Size of an AES block and of every IV in both formats
pub const IV_SIZE: usize = 16;

/// Size of a study storage key (AES-256)
pub const STUDY_KEY_SIZE: usize = 32;
