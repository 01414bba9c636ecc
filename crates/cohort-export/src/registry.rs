//! Chunk registry: which chunks exist, and where.
//!
//! [`ChunkRegistry`] is the seam to whatever database holds chunk
//! descriptors. [`MemoryRegistry`] keeps them in memory and persists to a
//! JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use cohort_core::{parse_api_time, Chunk, CohortError, CohortResult, DataStream};
use serde::Deserialize;
use thiserror::Error;

use crate::manifest::ExportManifest;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown data stream: {0}")]
    UnknownDataStream(String),

    #[error("invalid time {value:?}: expected YYYY-MM-DDThh:mm:ss")]
    InvalidTime { value: String },

    #[error("invalid {field} list: {detail}")]
    InvalidList { field: &'static str, detail: String },

    #[error("invalid registry manifest: {0}")]
    InvalidManifest(#[from] serde_json::Error),

    #[error("registry backend: {0}")]
    Backend(String),
}

impl From<CohortError> for QueryError {
    fn from(e: CohortError) -> Self {
        match e {
            CohortError::UnknownDataStream(s) => QueryError::UnknownDataStream(s),
            CohortError::InvalidTime { value } => QueryError::InvalidTime { value },
            other => QueryError::Backend(other.to_string()),
        }
    }
}

/// Filters for a registry query. Every `Some` filter must match; time
/// bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkQuery {
    pub study_id: String,
    pub participants: Option<Vec<String>>,
    pub streams: Option<Vec<DataStream>>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl ChunkQuery {
    pub fn for_study(study_id: impl Into<String>) -> Self {
        Self {
            study_id: study_id.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        chunk.study_id == self.study_id
            && self
                .participants
                .as_ref()
                .is_none_or(|ps| ps.iter().any(|p| *p == chunk.participant_id))
            && self
                .streams
                .as_ref()
                .is_none_or(|ss| ss.contains(&chunk.data_stream))
            && self.start.is_none_or(|start| chunk.time_bin >= start)
            && self.end.is_none_or(|end| chunk.time_bin <= end)
    }
}

/// Export request parameters as they arrive from a caller, still unparsed.
///
/// List fields accept a JSON array (`["gps","wifi"]`) or a plain
/// comma-separated list (`gps,wifi`). An absent or empty list means
/// "no filter".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportParams {
    pub study_id: String,
    #[serde(default)]
    pub data_streams: Option<String>,
    #[serde(default)]
    pub user_ids: Option<String>,
    #[serde(default)]
    pub time_start: Option<String>,
    #[serde(default)]
    pub time_end: Option<String>,
    /// Manifest JSON from the client's previous export
    #[serde(default)]
    pub registry: Option<String>,
}

impl ExportParams {
    /// Validate and convert into a query. Stream names are checked against
    /// the known stream set before anything is queried.
    pub fn to_query(&self) -> Result<ChunkQuery, QueryError> {
        let streams = match &self.data_streams {
            Some(raw) => {
                let names = parse_list("data_streams", raw)?;
                let streams = names
                    .iter()
                    .map(|n| n.parse::<DataStream>())
                    .collect::<CohortResult<Vec<_>>>()?;
                (!streams.is_empty()).then_some(streams)
            }
            None => None,
        };
        let participants = match &self.user_ids {
            Some(raw) => Some(parse_list("user_ids", raw)?).filter(|ps| !ps.is_empty()),
            None => None,
        };

        Ok(ChunkQuery {
            study_id: self.study_id.clone(),
            participants,
            streams,
            start: self.time_start.as_deref().map(parse_api_time).transpose()?,
            end: self.time_end.as_deref().map(parse_api_time).transpose()?,
        })
    }

    /// The client's manifest, if one was sent.
    pub fn manifest(&self) -> Result<Option<ExportManifest>, QueryError> {
        match self.registry.as_deref().map(str::trim) {
            Some(json) if !json.is_empty() => Ok(Some(ExportManifest::from_json(json)?)),
            _ => Ok(None),
        }
    }
}

fn parse_list(field: &'static str, raw: &str) -> Result<Vec<String>, QueryError> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        return serde_json::from_str(raw).map_err(|e| QueryError::InvalidList {
            field,
            detail: e.to_string(),
        });
    }
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

/// Storage of chunk descriptors.
#[async_trait]
pub trait ChunkRegistry: Send + Sync {
    /// Chunks matching `query`, in no particular order.
    async fn query(&self, query: &ChunkQuery) -> Result<Vec<Chunk>, QueryError>;

    /// Insert `chunk`, replacing any chunk with the same storage path.
    async fn register(&self, chunk: Chunk) -> CohortResult<()>;
}

/// In-memory registry keyed by storage path, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    path: Option<PathBuf>,
    chunks: RwLock<BTreeMap<String, Chunk>>,
    dirty: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`, or start empty if the file doesn't exist yet.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let chunks = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading chunk registry: {}", path.display()))?;
            let list: Vec<Chunk> = serde_json::from_str(&content)
                .with_context(|| format!("parsing chunk registry: {}", path.display()))?;
            list.into_iter()
                .map(|c| (c.storage_path.clone(), c))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            chunks: RwLock::new(chunks),
            dirty: AtomicBool::new(false),
        })
    }

    /// Write pending changes with an atomic temp-file rename. No-op for
    /// registries without a backing file.
    pub fn flush(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        // cleared before the snapshot so a concurrent register re-marks it
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let written = self.write_snapshot(path);
        if written.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        written
    }

    fn write_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating registry dir: {}", parent.display()))?;
        }

        let json = {
            let chunks = self
                .chunks
                .read()
                .map_err(|_| anyhow::anyhow!("chunk registry lock poisoned"))?;
            let list: Vec<&Chunk> = chunks.values().collect();
            serde_json::to_string_pretty(&list).context("serializing chunk registry")?
        };

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing chunk registry temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming chunk registry: {}", path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("failed to flush chunk registry on drop: {e}");
        }
    }
}

#[async_trait]
impl ChunkRegistry for MemoryRegistry {
    async fn query(&self, query: &ChunkQuery) -> Result<Vec<Chunk>, QueryError> {
        let chunks = self
            .chunks
            .read()
            .map_err(|_| QueryError::Backend("chunk registry lock poisoned".into()))?;
        Ok(chunks.values().filter(|c| query.matches(c)).cloned().collect())
    }

    async fn register(&self, chunk: Chunk) -> CohortResult<()> {
        let mut chunks = self
            .chunks
            .write()
            .map_err(|_| CohortError::Registry("chunk registry lock poisoned".into()))?;
        chunks.insert(chunk.storage_path.clone(), chunk);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }
}
