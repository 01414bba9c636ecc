//! Storage health checks

use anyhow::{Context, Result};
use opendal::Operator;

use crate::store::ObjectStore;

/// Object written and read back by [`probe_round_trip`]
pub const PROBE_PATH: &str = ".cohort-health";

/// Verify the storage endpoint is reachable by listing the root
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}

/// Write a probe object and read it back.
///
/// Stronger than [`check_health`]: catches read-only buckets and bad
/// credentials that still allow listing.
pub async fn probe_round_trip(store: &dyn ObjectStore) -> Result<()> {
    let payload = b"cohort".to_vec();
    store
        .put(PROBE_PATH, payload.clone())
        .await
        .context("writing health probe")?;
    let read = store.get(PROBE_PATH).await.context("reading health probe")?;
    if read != payload {
        anyhow::bail!("health probe read back {} bytes that do not match", read.len());
    }
    Ok(())
}
