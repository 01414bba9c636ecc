use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from cohort.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub export: ExportConfig,
    pub diagnostics: DiagnosticsConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend: "s3", "fs", or "memory"
    pub backend: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Root directory for the "fs" backend
    pub root: PathBuf,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

/// Upload handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Extensions accepted for storage
    pub allowed_extensions: Vec<String>,
    /// Extensions whose decrypted lines are never copied into diagnostics
    pub sensitive_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Number of concurrent chunk retrievals
    pub concurrency: usize,
    /// What to do when a chunk can't be retrieved: "skip" or "abort"
    pub failure_policy: String,
    /// Failures tolerated before an "abort" export gives up
    pub max_failures: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Append-only JSON-lines file for decryption diagnostics (logs only if unset)
    pub jsonl_path: Option<PathBuf>,
    /// Also write per-line error records (staging deployments)
    pub record_line_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// RSA modulus size for new study key pairings
    pub rsa_key_bits: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "s3".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "cohort".into(),
            root: PathBuf::from("/var/lib/cohort/objects"),
            enforce_tls: false,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: ["csv", "json", "mp4", "wav", "txt", "jpg"]
                .into_iter()
                .map(String::from)
                .collect(),
            sensitive_extensions: ["mp4", "wav", "jpg"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            failure_policy: "skip".into(),
            max_failures: 1,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self { rsa_key_bits: 2048 }
    }
}
