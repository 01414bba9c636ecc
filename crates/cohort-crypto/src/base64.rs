//! URL-safe base64 as spoken by the devices.
//!
//! Decoding accepts the standard alphabet too (some clients emit `+`/`/`), and
//! splits failures into two kinds that downstream classification depends on:
//! a stripped length that can never be valid base64, versus a plausible length
//! with broken padding or alphabet.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Base64Error {
    /// Length after stripping `=` is not a multiple of 4.
    #[error("base64 data has invalid length {length} after padding was removed")]
    Length { length: usize },

    /// Length is plausible but the padding or alphabet is malformed.
    #[error("base64 padding error: {detail}")]
    Padding { detail: String },
}

/// Padded URL-safe decoder that ignores non-zero trailing bits, as the
/// device-side decoders do.
const DEVICE_DECODER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireCanonical),
);

/// Encode bytes as URL-safe, padded base64.
pub fn encode_base64(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

/// Decode URL-safe (or standard) base64.
pub fn decode_base64(data: &[u8]) -> Result<Vec<u8>, Base64Error> {
    let trimmed = data.trim_ascii();
    let normalized: Vec<u8> = trimmed
        .iter()
        .map(|&b| match b {
            b'+' => b'-',
            b'/' => b'_',
            other => other,
        })
        .collect();

    DEVICE_DECODER.decode(&normalized).map_err(|e| {
        let length = strip_padding(&normalized).len();
        if length % 4 != 0 {
            Base64Error::Length { length }
        } else {
            Base64Error::Padding {
                detail: e.to_string(),
            }
        }
    })
}

fn strip_padding(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|&b| b != b'=').unwrap_or(data.len());
    let end = data.iter().rposition(|&b| b != b'=').map_or(start, |i| i + 1);
    &data[start..end]
}
