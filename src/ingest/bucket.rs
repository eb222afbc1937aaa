//! Bucket-assigned fragmentation
//!
//! The fallback path for members whose fragmentation was already decided
//! upstream: each member arrives with the identifiers of the buckets it
//! belongs to, and the engine materializes those buckets, memberships and
//! externally described navigation edges without inspecting timestamps.

use crate::ingest::error::IngestResult;
use crate::model::Relation;
use crate::repository::{FragmentPatch, Repository};
use std::sync::Arc;

/// An externally described change to a bucket fragment.
///
/// Absent fields leave the stored bucket untouched, so upstream systems can
/// announce a bucket's existence, seal it, or promote it to an entry point
/// in separate messages.
#[derive(Debug, Clone, Default)]
pub struct BucketUpdate {
    /// Bucket fragment identifier, unique within the stream
    pub id: String,
    /// Mark (or unmark) the bucket as a tree entry point
    pub root: Option<bool>,
    /// Seal the bucket against further writes by readers' contract
    pub immutable: Option<bool>,
    /// Drop all current memberships of the bucket
    pub empty: Option<bool>,
}

impl BucketUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Builder method: set the root flag
    pub fn root(mut self, root: bool) -> Self {
        self.root = Some(root);
        self
    }

    /// Builder method: set the immutable flag
    pub fn immutable(mut self, immutable: bool) -> Self {
        self.immutable = Some(immutable);
        self
    }

    /// Builder method: clear the member list
    pub fn empty(mut self) -> Self {
        self.empty = Some(true);
        self
    }

    fn into_patch(self) -> FragmentPatch {
        let mut patch = FragmentPatch::new();
        if let Some(root) = self.root {
            patch = patch.root(root);
        }
        if let Some(immutable) = self.immutable {
            patch = patch.immutable(immutable);
        }
        if self.empty == Some(true) {
            patch = patch.clear_members();
        }
        patch
    }
}

/// Materializes externally decided bucket assignments
pub struct BucketStrategy {
    repository: Arc<dyn Repository>,
}

impl BucketStrategy {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Set-add one member into each of its assigned buckets, creating
    /// buckets on first reference
    pub async fn add_member(
        &self,
        stream_id: &str,
        member_id: &str,
        buckets: &[String],
    ) -> IngestResult<()> {
        for bucket in buckets {
            tracing::trace!(stream = stream_id, member = member_id, bucket = %bucket, "bucket assignment");
            self.repository
                .add_member_to_bucket(stream_id, bucket, member_id)
                .await?;
        }
        Ok(())
    }

    /// Create-or-patch a bucket from an upstream description
    pub async fn upsert_bucket(&self, stream_id: &str, update: BucketUpdate) -> IngestResult<()> {
        let id = update.id.clone();
        self.repository
            .upsert_bucket(stream_id, &id, update.into_patch())
            .await?;
        Ok(())
    }

    /// Set-add an externally described navigation edge
    pub async fn upsert_relation(&self, relation: &Relation) -> IngestResult<()> {
        self.repository
            .append_relations(std::slice::from_ref(relation))
            .await?;
        Ok(())
    }

    /// Retract edges matching the relation; path and value narrow the match
    /// when present on it. Returns how many edges were removed.
    pub async fn remove_relation(&self, relation: &Relation) -> IngestResult<u64> {
        let removed = self
            .repository
            .remove_relations(relation, relation.path.as_deref(), relation.value.as_deref())
            .await?;
        Ok(removed)
    }
}
