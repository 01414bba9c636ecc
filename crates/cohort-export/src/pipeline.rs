//! Bulk export: dedup, bounded concurrent retrieval, archive assembly.
//!
//! Retrieval tasks run on a `JoinSet` gated by a semaphore. Each task returns
//! its chunk index with the result; only the coordinating task touches the
//! archive and manifest, writing entries in query order.

use std::sync::Arc;

use async_trait::async_trait;
use cohort_core::config::ExportConfig;
use cohort_core::Chunk;
use cohort_crypto::{decrypt_from_storage, StudyKey};
use cohort_storage::ObjectStore;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::archive::{entry_name, ArchiveWriter, DOWNLOAD_FILE_NAME, MANIFEST_ENTRY};
use crate::manifest::{content_hash, ExportManifest};

/// Progress callback: (done, total, storage path)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export aborted: {failed} chunks failed (limit {limit})")]
    TooManyFailures {
        failed: usize,
        limit: usize,
        failures: Vec<ChunkFailure>,
    },

    #[error("writing archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("retrieval task panicked: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Where chunk plaintext comes from.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch(&self, chunk: &Chunk) -> anyhow::Result<Vec<u8>>;
}

/// Reads blobs from an object store and decrypts them with the study key,
/// checking the plaintext against the chunk's content hash.
pub struct EncryptedStoreSource {
    store: Arc<dyn ObjectStore>,
    key: StudyKey,
}

impl EncryptedStoreSource {
    pub fn new(store: Arc<dyn ObjectStore>, key: StudyKey) -> Self {
        Self { store, key }
    }
}

#[async_trait]
impl ChunkSource for EncryptedStoreSource {
    async fn fetch(&self, chunk: &Chunk) -> anyhow::Result<Vec<u8>> {
        let blob = self.store.get(&chunk.storage_path).await?;
        let plaintext = decrypt_from_storage(&self.key, &blob)?;
        let hash = content_hash(&plaintext);
        if hash != chunk.content_hash {
            anyhow::bail!(
                "content hash mismatch for {}: registry has {}, store yields {hash}",
                chunk.storage_path,
                chunk.content_hash
            );
        }
        Ok(plaintext)
    }
}

/// What to do when a chunk cannot be retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Leave the chunk out of the archive and manifest, report it
    #[default]
    Skip,
    /// Fail the export once `max_failures` chunks have failed
    Abort { max_failures: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Archive bytes with the updated manifest embedded as `registry`
    #[default]
    Raw,
    /// A `data.zip` download without the manifest entry
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    pub mode: OutputMode,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            failure_policy: FailurePolicy::Skip,
            mode: OutputMode::Raw,
        }
    }
}

impl ExportOptions {
    pub fn from_config(cfg: &ExportConfig) -> anyhow::Result<Self> {
        let failure_policy = match cfg.failure_policy.as_str() {
            "skip" => FailurePolicy::Skip,
            "abort" => FailurePolicy::Abort {
                max_failures: cfg.max_failures.max(1),
            },
            other => {
                anyhow::bail!("unknown export.failure_policy '{other}' (expected skip or abort)")
            }
        };
        Ok(Self {
            concurrency: cfg.concurrency.max(1),
            failure_policy,
            mode: OutputMode::Raw,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub storage_path: String,
    pub reason: String,
}

/// A finished export.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    pub bytes: Vec<u8>,
    /// `Some("data.zip")` in download mode
    pub file_name: Option<&'static str>,
    /// Every chunk included in this archive
    pub manifest: ExportManifest,
    /// Chunks the client already held
    pub skipped: usize,
    pub failures: Vec<ChunkFailure>,
}

/// Run an export over `chunks`.
pub async fn export(
    chunks: Vec<Chunk>,
    held: Option<&ExportManifest>,
    source: Arc<dyn ChunkSource>,
    options: &ExportOptions,
    progress: Option<&ProgressFn>,
) -> Result<ExportArchive, ExportError> {
    let total_found = chunks.len();
    let wanted: Vec<Chunk> = chunks
        .into_iter()
        .filter(|c| !held.is_some_and(|m| m.holds(c)))
        .collect();
    let skipped = total_found - wanted.len();
    let total = wanted.len() as u64;

    info!(
        found = total_found,
        skipped,
        fetching = wanted.len(),
        concurrency = options.concurrency,
        "starting export"
    );

    let wanted = Arc::new(wanted);
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for index in 0..wanted.len() {
        let wanted = wanted.clone();
        let source = source.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => source.fetch(&wanted[index]).await,
                Err(e) => Err(anyhow::anyhow!("retrieval pool closed: {e}")),
            };
            (index, result)
        });
    }

    let mut slots: Vec<Option<Vec<u8>>> = vec![None; wanted.len()];
    let mut failures = Vec::new();
    let mut done = 0u64;

    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined?;
        let chunk = &wanted[index];
        done += 1;

        match result {
            Ok(data) => {
                debug!(path = %chunk.storage_path, bytes = data.len(), "retrieved chunk");
                slots[index] = Some(data);
            }
            Err(e) => {
                warn!(path = %chunk.storage_path, "chunk retrieval failed: {e:#}");
                failures.push(ChunkFailure {
                    storage_path: chunk.storage_path.clone(),
                    reason: format!("{e:#}"),
                });
                if let FailurePolicy::Abort { max_failures } = options.failure_policy {
                    if failures.len() >= max_failures {
                        tasks.abort_all();
                        return Err(ExportError::TooManyFailures {
                            failed: failures.len(),
                            limit: max_failures,
                            failures,
                        });
                    }
                }
            }
        }

        if let Some(cb) = progress {
            cb(done, total, &chunk.storage_path);
        }
    }

    let mut writer = ArchiveWriter::new();
    let mut manifest = ExportManifest::new();
    for (chunk, data) in wanted.iter().zip(slots) {
        let Some(data) = data else { continue };
        writer.add(&entry_name(chunk), &data)?;
        manifest.insert(chunk.storage_path.clone(), chunk.content_hash.clone());
    }

    let file_name = match options.mode {
        OutputMode::Raw => {
            writer.add(MANIFEST_ENTRY, manifest.to_json().as_bytes())?;
            None
        }
        OutputMode::Download => Some(DOWNLOAD_FILE_NAME),
    };
    let bytes = writer.finish()?;

    info!(
        included = manifest.len(),
        failed = failures.len(),
        bytes = bytes.len(),
        "export complete"
    );

    Ok(ExportArchive {
        bytes,
        file_name,
        manifest,
        skipped,
        failures,
    })
}
