//! cohort-export: chunk registry queries and bulk export
//!
//! Flow: [`ExportParams`] → [`ChunkQuery`] → [`ChunkRegistry::query`] →
//! [`export`] (dedup against the caller's [`ExportManifest`], concurrent
//! retrieval, ZIP assembly) → [`ExportArchive`].

pub mod archive;
pub mod manifest;
pub mod pipeline;
pub mod registry;

pub use archive::{entry_name, ArchiveWriter, DOWNLOAD_FILE_NAME, MANIFEST_ENTRY};
pub use manifest::{content_hash, ExportManifest};
pub use pipeline::{
    export, ChunkFailure, ChunkSource, EncryptedStoreSource, ExportArchive, ExportError,
    ExportOptions, FailurePolicy, OutputMode, ProgressFn,
};
pub use registry::{ChunkQuery, ChunkRegistry, ExportParams, MemoryRegistry, QueryError};
