//! Error taxonomy for device-upload decryption.
//!
//! Every primitive returns a typed failure; classification into line-error
//! kinds and their policy is an exhaustive `match`, never message inspection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::base64::Base64Error;
use crate::file::FileDecryption;

/// Why a single `iv:ciphertext` line could not be decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineFailure {
    #[error("line is blank")]
    Blank,

    #[error("line is not of the form iv:ciphertext")]
    Malformed,

    #[error(transparent)]
    Base64(#[from] Base64Error),

    #[error("line contains no ciphertext")]
    EmptyCiphertext,

    #[error("line contains no iv")]
    MissingIv,

    #[error("symmetric key is empty")]
    EmptyKey,

    #[error("symmetric key has bad length {0}")]
    KeyLength(usize),

    #[error("iv has bad length {0}")]
    IvLength(usize),

    #[error("ciphertext length {0} is not a multiple of 16")]
    CiphertextLength(usize),

    #[error("PKCS#5 padding is invalid")]
    Padding,
}

impl LineFailure {
    /// Map to a recorded error kind, or `None` if this failure is not one the
    /// decryptor knows how to handle.
    pub fn classify(&self) -> Option<LineErrorKind> {
        match self {
            LineFailure::Blank => Some(LineErrorKind::LineIsBlank),
            LineFailure::Malformed => Some(LineErrorKind::MalformedStructure),
            LineFailure::Base64(Base64Error::Padding { .. }) => {
                Some(LineErrorKind::TruncatedBase64)
            }
            LineFailure::Base64(Base64Error::Length { .. }) => None,
            LineFailure::EmptyCiphertext => Some(LineErrorKind::EmptyCiphertext),
            LineFailure::MissingIv => Some(LineErrorKind::MissingIv),
            LineFailure::EmptyKey => Some(LineErrorKind::EmptyKey),
            LineFailure::KeyLength(_) => Some(LineErrorKind::KeyBadLength),
            LineFailure::IvLength(_) => Some(LineErrorKind::IvBadLength),
            LineFailure::CiphertextLength(_) => Some(LineErrorKind::InvalidLength),
            LineFailure::Padding => Some(LineErrorKind::PaddingError),
        }
    }
}

/// Recorded kind of a line-level decryption error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineErrorKind {
    LineIsBlank,
    PaddingError,
    EmptyKey,
    MalformedStructure,
    InvalidLength,
    EmptyCiphertext,
    MissingIv,
    KeyBadLength,
    IvBadLength,
    /// Base64 padding broken mid-file; seen with truncated binary streams
    TruncatedBase64,
}

impl LineErrorKind {
    /// Fatal kinds stop decryption of the rest of the file.
    pub fn is_fatal(&self) -> bool {
        match self {
            LineErrorKind::KeyBadLength
            | LineErrorKind::IvBadLength
            | LineErrorKind::TruncatedBase64 => true,
            LineErrorKind::LineIsBlank
            | LineErrorKind::PaddingError
            | LineErrorKind::EmptyKey
            | LineErrorKind::MalformedStructure
            | LineErrorKind::InvalidLength
            | LineErrorKind::EmptyCiphertext
            | LineErrorKind::MissingIv => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LineErrorKind::LineIsBlank => "line_is_blank",
            LineErrorKind::PaddingError => "padding_error",
            LineErrorKind::EmptyKey => "empty_key",
            LineErrorKind::MalformedStructure => "malformed_structure",
            LineErrorKind::InvalidLength => "invalid_length",
            LineErrorKind::EmptyCiphertext => "empty_ciphertext",
            LineErrorKind::MissingIv => "missing_iv",
            LineErrorKind::KeyBadLength => "key_bad_length",
            LineErrorKind::IvBadLength => "iv_bad_length",
            LineErrorKind::TruncatedBase64 => "truncated_base64",
        }
    }
}

impl std::fmt::Display for LineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified line failure with its position and neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    pub kind: LineErrorKind,
    /// Index in the non-empty line list; the envelope is index 0
    pub index: usize,
    pub line: Vec<u8>,
    pub prev_line: Vec<u8>,
    pub next_line: Vec<u8>,
}

/// Why the envelope line did not yield a symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("envelope is not valid base64: {0}")]
    EnvelopeEncoding(Base64Error),

    #[error("envelope did not unwrap with the study key: {0}")]
    Unwrap(String),

    #[error("unwrapped key is not valid base64: {0}")]
    KeyEncoding(Base64Error),
}

/// File-level failure of device-upload decryption.
#[derive(Debug, Error)]
pub enum FileDecryptError {
    #[error("the file had no data in it")]
    EmptyFile,

    #[error("invalid decryption key: {0}")]
    KeyInvalid(#[from] KeyError),

    /// A fatal line error; `partial` holds what was decrypted before it.
    #[error("line {index}: {kind} stopped decryption of the remaining file")]
    Aborted {
        kind: LineErrorKind,
        index: usize,
        partial: Box<FileDecryption>,
    },

    /// A failure no handling policy exists for. Callers treat this as a
    /// server fault, not bad device data.
    #[error("unclassified failure on line {index}: {source}")]
    Unclassified {
        index: usize,
        #[source]
        source: LineFailure,
    },
}

impl FileDecryptError {
    /// True for failures the upload path answers with "delete the file".
    pub fn is_handled(&self) -> bool {
        match self {
            FileDecryptError::EmptyFile
            | FileDecryptError::KeyInvalid(_)
            | FileDecryptError::Aborted { .. } => true,
            FileDecryptError::Unclassified { .. } => false,
        }
    }
}
