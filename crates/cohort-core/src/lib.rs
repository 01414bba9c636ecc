pub mod config;
pub mod error;
pub mod types;

pub use error::{CohortError, CohortResult};
pub use types::{parse_api_time, Chunk, DataStream, API_TIME_FORMAT};
