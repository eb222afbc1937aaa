//! Immutability sweeper
//!
//! After a batch advances a stream's high-water mark, every temporal
//! fragment whose range has fully elapsed relative to that mark is sealed.
//! Sealing is one-way; a fragment never reverts to mutable.

use crate::ingest::error::IngestResult;
use crate::repository::Repository;
use std::sync::Arc;

pub struct Sweeper {
    repository: Arc<dyn Repository>,
}

impl Sweeper {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Seal the elapsed fragments of `stream_id` given the highest timestamp
    /// observed so far. Returns how many fragments were newly sealed.
    pub async fn sweep(&self, stream_id: &str, t_max: i64) -> IngestResult<u64> {
        let sealed = self.repository.sweep_immutable(stream_id, t_max).await?;
        if sealed > 0 {
            tracing::debug!(stream = stream_id, t_max, sealed, "sealed elapsed fragments");
        }
        Ok(sealed)
    }
}
