//! OpenDAL Operator factory for cohort storage backends

use anyhow::{Context, Result};
use cohort_core::config::StorageConfig;
use opendal::Operator;

/// S3 credentials. Never logged.
#[derive(Clone, Default)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    /// Read `COHORT_ACCESS_KEY_ID` / `COHORT_SECRET_ACCESS_KEY`, falling back
    /// to the standard `AWS_*` variables.
    pub fn from_env() -> Option<Self> {
        let var = |cohort: &str, aws: &str| {
            std::env::var(cohort)
                .or_else(|_| std::env::var(aws))
                .ok()
                .filter(|v| !v.is_empty())
        };
        Some(Self {
            access_key_id: var("COHORT_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID")?,
            secret_access_key: var("COHORT_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY")?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build an OpenDAL Operator for an S3-compatible endpoint.
///
/// Uses path-style addressing (the opendal default), which MinIO and other
/// self-hosted S3 servers need.
pub fn build_operator(storage: &StorageConfig, creds: &Credentials) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .access_key_id(&creds.access_key_id)
        .secret_access_key(&creds.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build the operator selected by `storage.backend`: `s3`, `fs` or `memory`.
///
/// For S3, if `enforce_tls` is true and the endpoint uses HTTP, this returns
/// an error; otherwise a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &StorageConfig,
    creds: Option<&Credentials>,
) -> Result<Operator> {
    match storage.backend.as_str() {
        "s3" => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        storage.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP; participant data and credentials travel unencrypted"
                );
            }
            let creds = creds.context(
                "S3 backend needs credentials (COHORT_ACCESS_KEY_ID / AWS_ACCESS_KEY_ID and the matching secret)",
            )?;
            build_operator(storage, creds)
        }
        "fs" => {
            let root = storage
                .root
                .to_str()
                .context("storage.root is not valid UTF-8")?;
            let op = Operator::new(opendal::services::Fs::default().root(root))
                .with_context(|| format!("creating filesystem operator at {root}"))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish();
            Ok(op)
        }
        "memory" => {
            tracing::warn!("using in-memory storage; nothing will persist");
            Ok(Operator::new(opendal::services::Memory::default())
                .context("creating memory operator")?
                .finish())
        }
        other => anyhow::bail!("unknown storage backend '{other}' (expected s3, fs or memory)"),
    }
}
