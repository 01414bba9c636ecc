//! Single-line decryption: `base64(iv):base64(AES-CBC ciphertext)`.
//!
//! Checks run in a fixed order so each malformed input maps to exactly one
//! [`LineFailure`]. Padding is stripped by hand after an unpadded CBC pass so
//! that a bad pad byte is reported as such instead of as a cipher error.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

use crate::base64::decode_base64;
use crate::error::LineFailure;
use crate::IV_SIZE;

const BLOCK_SIZE: usize = 16;

/// Decrypt one data line of a device upload with the file's symmetric key.
pub fn decrypt_device_line(key: &[u8], line: &[u8]) -> Result<Vec<u8>, LineFailure> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Err(LineFailure::Blank);
    }

    let sep = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(LineFailure::Malformed)?;
    let (iv_part, rest) = (&line[..sep], &line[sep + 1..]);
    if rest.contains(&b':') {
        return Err(LineFailure::Malformed);
    }

    let iv = decode_base64(iv_part)?;
    let ciphertext = decode_base64(rest)?;

    if ciphertext.is_empty() {
        return Err(LineFailure::EmptyCiphertext);
    }
    if iv.is_empty() {
        return Err(LineFailure::MissingIv);
    }
    if key.is_empty() {
        return Err(LineFailure::EmptyKey);
    }
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(LineFailure::KeyLength(key.len()));
    }
    if iv.len() != IV_SIZE {
        return Err(LineFailure::IvLength(iv.len()));
    }
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(LineFailure::CiphertextLength(ciphertext.len()));
    }

    let decrypted = cbc_decrypt(key, &iv, &ciphertext)?;
    strip_pkcs5(decrypted)
}

fn cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, LineFailure> {
    let key_err = |_| LineFailure::KeyLength(key.len());
    let len_err = |_| LineFailure::CiphertextLength(ciphertext.len());
    match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(key_err)?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(len_err),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(key_err)?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(len_err),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(key_err)?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(len_err),
        n => Err(LineFailure::KeyLength(n)),
    }
}

/// Remove PKCS#5 padding: the last byte gives the pad length.
fn strip_pkcs5(mut data: Vec<u8>) -> Result<Vec<u8>, LineFailure> {
    let pad = *data.last().ok_or(LineFailure::Padding)? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return Err(LineFailure::Padding);
    }
    data.truncate(data.len() - pad);
    Ok(data)
}
