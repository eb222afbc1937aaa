//! Storage boundary for the fragmentation index
//!
//! The insertion engines only talk to a narrow [`Repository`] contract; a
//! backend supplies fragment lookups, set-semantics member adds, relation
//! appends and the batched multi-document write used by splits. Two
//! embedded reference backends ship with the crate:
//!
//! - **MemoryRepository**: hash maps behind an async `RwLock`; batch writes
//!   hold the write lock for their whole extent and are therefore atomic.
//! - **SqliteRepository**: document-store-style tables over `rusqlite`; batch
//!   writes run inside one SQLite transaction.
//!
//! Both honor the same contract; only the mechanics of atomicity differ.
//! Real network backends (document or key-value stores) plug in through the
//! same trait.

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

use crate::model::{Fragment, MemberRecord, Relation};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by repository backends
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Backend/driver failure (I/O, SQL, protocol)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A mutation referenced a fragment that does not exist
    #[error("Unknown fragment: {0}")]
    UnknownFragment(String),

    /// The configured backend URL has an unrecognized scheme
    #[error("Unknown repository scheme in URL: {0}")]
    UnknownScheme(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(err: rusqlite::Error) -> Self {
        RepositoryError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

/// Result type alias for repository operations
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Partial update of a fragment row; absent fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentPatch {
    /// Replace the member list (and `count`, kept in sync)
    pub members: Option<Vec<String>>,
    pub immutable: Option<bool>,
    pub root: Option<bool>,
}

impl FragmentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: replace the member list
    pub fn members(mut self, members: Vec<String>) -> Self {
        self.members = Some(members);
        self
    }

    /// Builder method: clear the member list
    pub fn clear_members(self) -> Self {
        self.members(Vec::new())
    }

    /// Builder method: set the immutable flag
    pub fn immutable(mut self, immutable: bool) -> Self {
        self.immutable = Some(immutable);
        self
    }

    /// Builder method: set the root flag
    pub fn root(mut self, root: bool) -> Self {
        self.root = Some(root);
        self
    }
}

/// One entry of a batched index write.
///
/// A split emits its whole effect (new sub-fragments or pagination sibling,
/// navigation relations, the cleared/truncated parent) as one mutation list
/// so the backend can apply it as a single atomic write where it supports
/// one.
#[derive(Debug, Clone)]
pub enum IndexMutation {
    /// Insert a fragment; idempotent by `(stream_id, id)` identity
    CreateFragment(Fragment),
    /// Partially update an existing fragment
    PatchFragment {
        stream_id: String,
        fragment_id: String,
        patch: FragmentPatch,
    },
    /// Add-to-set of a navigation edge
    AppendRelation(Relation),
}

/// The minimal storage contract the insertion engines require.
///
/// All operations are remote-storage calls in a real deployment and must be
/// awaited; writers are serialized per stream by the caller (the engine), so
/// implementations need no cross-call coordination beyond per-operation
/// atomicity.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Best-match candidate lookup: the temporal fragment of `stream_id` with
    /// the greatest `(start, page)` and smallest `span` such that
    /// `start <= timestamp` (ordering `start DESC, span ASC, page DESC`).
    /// Fragments without a time window never match.
    async fn find_candidate(&self, stream_id: &str, timestamp: i64) -> RepoResult<Option<Fragment>>;

    /// Atomic set-add of `member_id` plus count increment on an existing fragment
    async fn insert_member(
        &self,
        stream_id: &str,
        fragment_id: &str,
        member_id: &str,
    ) -> RepoResult<()>;

    /// Insert a fragment; a no-op if one with the same identity already exists
    async fn create_fragment(&self, fragment: &Fragment) -> RepoResult<()>;

    /// Insert several fragments, each idempotent by identity
    async fn create_fragments(&self, fragments: &[Fragment]) -> RepoResult<()>;

    /// Partial update of an existing fragment
    async fn update_fragment(
        &self,
        stream_id: &str,
        fragment_id: &str,
        patch: FragmentPatch,
    ) -> RepoResult<()>;

    /// Create-or-patch a bucket fragment in one write (bucket-strategy mode)
    async fn upsert_bucket(
        &self,
        stream_id: &str,
        bucket_id: &str,
        patch: FragmentPatch,
    ) -> RepoResult<()>;

    /// Set-add of `member_id` into a bucket, creating the bucket if absent
    async fn add_member_to_bucket(
        &self,
        stream_id: &str,
        bucket_id: &str,
        member_id: &str,
    ) -> RepoResult<()>;

    /// Timestamps of the given members, sorted ascending; members without a
    /// stored timestamp are omitted. Used to re-materialize order during a split.
    async fn members_by_timestamp(&self, member_ids: &[String]) -> RepoResult<Vec<(String, i64)>>;

    /// Add-to-set append of navigation edges
    async fn append_relations(&self, relations: &[Relation]) -> RepoResult<()>;

    /// Remove edges matching the relation's `(stream, from, bucket, type)` and,
    /// when given, its path/value
    async fn remove_relations(
        &self,
        relation: &Relation,
        match_path: Option<&str>,
        match_value: Option<&str>,
    ) -> RepoResult<u64>;

    /// Number of temporal fragments currently indexed for a stream
    async fn count_fragments(&self, stream_id: &str) -> RepoResult<u64>;

    /// Whether a member payload has already been persisted
    async fn record_exists(&self, member_id: &str) -> RepoResult<bool>;

    /// Persist a member payload on first sight; a no-op if the id exists
    async fn put_record(&self, record: &MemberRecord) -> RepoResult<()>;

    /// Flip `immutable` on every mutable temporal fragment of the stream whose
    /// range has fully elapsed relative to `t_max`; returns how many flipped
    async fn sweep_immutable(&self, stream_id: &str, t_max: i64) -> RepoResult<u64>;

    /// Apply a batched index write, atomically where the backend supports it
    async fn apply(&self, mutations: Vec<IndexMutation>) -> RepoResult<()>;

    /// Persist a metadata entry (e.g. per-stream timestamp paths)
    async fn put_meta(&self, kind: &str, id: &str, value: &str) -> RepoResult<()>;

    /// Fetch one metadata entry
    async fn get_meta(&self, kind: &str, id: &str) -> RepoResult<Option<String>>;

    /// All metadata entries of a kind, as `(id, value)` pairs
    async fn list_meta(&self, kind: &str) -> RepoResult<Vec<(String, String)>>;
}

impl std::fmt::Debug for dyn Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Repository")
    }
}

/// Open a repository from a backend URL.
///
/// Recognized schemes: `memory://` (in-memory) and `sqlite://<path>`
/// (embedded). Anything else is a fatal misconfiguration, surfaced before
/// ingestion starts.
pub fn open(url: &str) -> RepoResult<Arc<dyn Repository>> {
    if url == "memory://" {
        Ok(Arc::new(MemoryRepository::new()))
    } else if let Some(path) = url.strip_prefix("sqlite://") {
        Ok(Arc::new(SqliteRepository::open(Path::new(path))?))
    } else {
        Err(RepositoryError::UnknownScheme(url.to_string()))
    }
}
