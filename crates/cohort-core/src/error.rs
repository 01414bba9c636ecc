use thiserror::Error;

pub type CohortResult<T> = Result<T, CohortError>;

#[derive(Debug, Error)]
pub enum CohortError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown data stream: {0}")]
    UnknownDataStream(String),

    #[error("invalid time {value:?}: expected YYYY-MM-DDThh:mm:ss")]
    InvalidTime { value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
