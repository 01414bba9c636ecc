//! The put/get seam between cohort and its object store.

use async_trait::async_trait;
use opendal::{ErrorKind, Operator};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage backend error at {path}: {source}")]
    Backend {
        path: String,
        #[source]
        source: opendal::Error,
    },
}

impl StorageError {
    fn from_opendal(path: &str, source: opendal::Error) -> Self {
        match source.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            _ => StorageError::Backend {
                path: path.to_string(),
                source,
            },
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Key-value byte store keyed by storage path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write (or overwrite) the object at `path`.
    async fn put(&self, path: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Read the whole object at `path`.
    ///
    /// Returns `StorageError::NotFound` if nothing is stored there.
    async fn get(&self, path: &str) -> StorageResult<Vec<u8>>;
}

#[async_trait]
impl ObjectStore for Operator {
    async fn put(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        self.write(path, data)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::from_opendal(path, e))
    }

    async fn get(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.read(path)
            .await
            .map(|buf| buf.to_vec())
            .map_err(|e| StorageError::from_opendal(path, e))
    }
}
