//! cohort-ingest: the device upload path
//!
//! An upload is decrypted line by line, validated by name, re-encrypted
//! under the study storage key, written to the object store and registered
//! as a chunk. Every request ends in one of three device-facing answers
//! (delete the file, or retry later) or a server fault.

pub mod error;
pub mod handler;
pub mod keys;
pub mod name;

pub use error::ServerFault;
pub use handler::{BenignReason, RejectReason, UploadHandler, UploadOutcome, UploadRequest};
pub use keys::{KeyProvider, StaticKeys};
pub use name::UploadName;
