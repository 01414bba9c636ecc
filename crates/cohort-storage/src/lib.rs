//! cohort-storage: object storage for encrypted chunk blobs
//!
//! Everything above this crate talks to [`ObjectStore`]; the OpenDAL
//! [`Operator`](opendal::Operator) is the one production implementation,
//! backed by S3, a local directory, or memory.

pub mod health;
pub mod operator;
pub mod store;

pub use health::{check_health, probe_round_trip};
pub use operator::{build_from_core_config, build_operator, Credentials};
pub use store::{ObjectStore, StorageError, StorageResult};
