//! Client-held export manifest: storage path → content hash.
//!
//! A client sends back the manifest from its previous export; chunks it
//! already holds at the same hash are not sent again.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cohort_core::Chunk;
use serde::{Deserialize, Serialize};

/// Content hash of a chunk plaintext: standard base64 of its BLAKE3 digest.
pub fn content_hash(data: &[u8]) -> String {
    STANDARD.encode(blake3::hash(data).as_bytes())
}

/// Flat JSON object mapping storage paths to content hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportManifest {
    entries: BTreeMap<String, String>,
}

impl ExportManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Compact JSON, as embedded in raw-mode archives.
    pub fn to_json(&self) -> String {
        // a string map cannot fail to serialize
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn insert(&mut self, storage_path: impl Into<String>, hash: impl Into<String>) {
        self.entries.insert(storage_path.into(), hash.into());
    }

    pub fn get(&self, storage_path: &str) -> Option<&str> {
        self.entries.get(storage_path).map(String::as_str)
    }

    /// True if the client already holds this exact version of `chunk`.
    pub fn holds(&self, chunk: &Chunk) -> bool {
        self.get(&chunk.storage_path) == Some(chunk.content_hash.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
