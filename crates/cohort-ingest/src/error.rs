use cohort_core::CohortError;
use cohort_crypto::FileDecryptError;
use cohort_storage::StorageError;
use thiserror::Error;

/// Failures on the server's side of an upload. The device keeps the file
/// and retries.
#[derive(Debug, Error)]
pub enum ServerFault {
    #[error("key lookup for participant {participant}: {source}")]
    KeyLookup {
        participant: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("decryption: {0}")]
    Decryption(#[source] FileDecryptError),

    #[error("storing upload: {0}")]
    Storage(#[from] StorageError),

    #[error("registering chunk: {0}")]
    Registry(#[from] CohortError),

    #[error("decryption task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
