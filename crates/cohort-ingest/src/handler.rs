//! The upload entry point.

use std::sync::Arc;

use cohort_core::config::IngestConfig;
use cohort_core::Chunk;
use cohort_crypto::{
    decrypt_device_file, encrypt_for_storage, DiagnosticContext, DiagnosticSink, FileDecryptError,
    LineErrorKind,
};
use cohort_export::{content_hash, ChunkRegistry};
use cohort_storage::ObjectStore;
use rand::rngs::OsRng;
use tracing::{info, warn};

use crate::error::ServerFault;
use crate::keys::KeyProvider;
use crate::name::{extension, UploadName};

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub study_id: String,
    pub participant_id: String,
    pub file_name: Option<String>,
    pub contents: Vec<u8>,
}

/// Uploads the device may delete without anything being stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenignReason {
    CrashLog,
    /// Android `rList-` artifacts
    SpuriousFile,
    EmptyFile,
    KeyInvalid,
    /// A fatal line error stopped decryption
    Aborted { kind: LineErrorKind, index: usize },
    /// Decryption succeeded but recovered nothing
    NoData,
}

/// Uploads that are wrong as sent; the device keeps them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NoFileName,
    InvalidExtension(String),
    BadFileName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted(Chunk),
    HandledBenign(BenignReason),
    Rejected(RejectReason),
}

impl UploadOutcome {
    /// Whether the device should delete its copy of the file.
    pub fn device_should_delete(&self) -> bool {
        match self {
            UploadOutcome::Accepted(_) | UploadOutcome::HandledBenign(_) => true,
            UploadOutcome::Rejected(_) => false,
        }
    }
}

pub struct UploadHandler {
    keys: Arc<dyn KeyProvider>,
    store: Arc<dyn ObjectStore>,
    registry: Arc<dyn ChunkRegistry>,
    sink: Arc<dyn DiagnosticSink>,
    config: IngestConfig,
}

impl UploadHandler {
    pub fn new(
        keys: Arc<dyn KeyProvider>,
        store: Arc<dyn ObjectStore>,
        registry: Arc<dyn ChunkRegistry>,
        sink: Arc<dyn DiagnosticSink>,
        config: IngestConfig,
    ) -> Self {
        Self {
            keys,
            store,
            registry,
            sink,
            config,
        }
    }

    pub async fn handle(&self, request: UploadRequest) -> Result<UploadOutcome, ServerFault> {
        let UploadRequest {
            study_id,
            participant_id,
            file_name,
            contents,
        } = request;

        let Some(file_name) = file_name.filter(|n| !n.trim().is_empty()) else {
            warn!(participant = %participant_id, "upload without a file name");
            return Ok(UploadOutcome::Rejected(RejectReason::NoFileName));
        };

        if file_name.to_ascii_lowercase().contains("crashlog") {
            warn!(
                participant = %participant_id,
                file = %file_name,
                bytes = contents.len(),
                "device crash log received"
            );
            return Ok(UploadOutcome::HandledBenign(BenignReason::CrashLog));
        }
        if file_name.starts_with("rList-") {
            return Ok(UploadOutcome::HandledBenign(BenignReason::SpuriousFile));
        }

        let private_key = self
            .keys
            .private_key(&study_id, &participant_id)
            .await
            .map_err(|source| ServerFault::KeyLookup {
                participant: participant_id.clone(),
                source,
            })?;

        let ext = extension(&file_name);
        let sensitive = ext
            .as_ref()
            .is_some_and(|e| self.config.sensitive_extensions.contains(e));
        let ctx =
            DiagnosticContext::new(participant_id.clone(), file_name.clone()).redacted(sensitive);

        // RSA and line decryption are CPU bound
        let sink = self.sink.clone();
        let decrypted = tokio::task::spawn_blocking(move || {
            decrypt_device_file(&ctx, &contents, &private_key, sink.as_ref())
        })
        .await?;

        let plaintext = match decrypted {
            Ok(result) => result.plaintext,
            Err(e) => return self.decryption_failed(&participant_id, &file_name, e),
        };
        if plaintext.is_empty() {
            return Ok(UploadOutcome::HandledBenign(BenignReason::NoData));
        }

        if !ext
            .as_ref()
            .is_some_and(|e| self.config.allowed_extensions.contains(e))
        {
            warn!(file = %file_name, "upload has an invalid extension");
            return Ok(UploadOutcome::Rejected(RejectReason::InvalidExtension(
                ext.unwrap_or_default(),
            )));
        }
        let name = match UploadName::parse(&file_name) {
            Some(name) if name.participant_id == participant_id => name,
            _ => {
                warn!(
                    participant = %participant_id,
                    file = %file_name,
                    "upload has a malformed file name"
                );
                return Ok(UploadOutcome::Rejected(RejectReason::BadFileName(file_name)));
            }
        };
        let Some(time_bin) = name.time_bin() else {
            return Ok(UploadOutcome::Rejected(RejectReason::BadFileName(file_name)));
        };

        let storage_key = self
            .keys
            .storage_key(&study_id)
            .await
            .map_err(|source| ServerFault::KeyLookup {
                participant: participant_id.clone(),
                source,
            })?;
        let path = name.storage_path(&study_id);
        let blob = encrypt_for_storage(&mut OsRng, &storage_key, &plaintext);
        self.store.put(&path, blob).await?;

        let chunk = Chunk {
            study_id,
            participant_id,
            data_stream: name.data_stream,
            time_bin,
            byte_size: plaintext.len() as u64,
            content_hash: content_hash(&plaintext),
            storage_path: path,
        };
        self.registry.register(chunk.clone()).await?;

        info!(
            participant = %chunk.participant_id,
            stream = %chunk.data_stream,
            path = %chunk.storage_path,
            bytes = chunk.byte_size,
            "upload stored"
        );
        Ok(UploadOutcome::Accepted(chunk))
    }

    fn decryption_failed(
        &self,
        participant_id: &str,
        file_name: &str,
        error: FileDecryptError,
    ) -> Result<UploadOutcome, ServerFault> {
        let reason = match &error {
            FileDecryptError::EmptyFile => BenignReason::EmptyFile,
            FileDecryptError::KeyInvalid(_) => BenignReason::KeyInvalid,
            FileDecryptError::Aborted {
                kind,
                index,
                partial,
            } => {
                // TODO: store the salvaged lines once the registry can mark a chunk as partial
                info!(
                    participant = %participant_id,
                    file = %file_name,
                    salvaged_lines = partial.decrypted_lines,
                    "discarding partially decrypted upload"
                );
                BenignReason::Aborted {
                    kind: *kind,
                    index: *index,
                }
            }
            FileDecryptError::Unclassified { .. } => {
                return Err(ServerFault::Decryption(error));
            }
        };
        warn!(participant = %participant_id, file = %file_name, "upload not decrypted: {error}");
        Ok(UploadOutcome::HandledBenign(reason))
    }
}
