//! Ingestion orchestration
//!
//! [`Ingester`] is the write-side entry point of the crate. It persists
//! member payloads exactly once, dispatches each member to the
//! time-partitioned engine or the bucket-strategy engine, serializes writers
//! per stream, and runs the immutability sweeper once per batch for every
//! stream whose high-water mark advanced.

use crate::config::FragmentationConfig;
use crate::ingest::bucket::{BucketStrategy, BucketUpdate};
use crate::ingest::error::{IngestError, IngestResult};
use crate::ingest::sweeper::Sweeper;
use crate::ingest::timestamp::{InsertOutcome, TimeFragmenter};
use crate::model::{MemberRecord, Relation};
use crate::repository::{Repository, RepositoryError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const STREAM_META_KIND: &str = "stream";

/// Persisted per-stream registration, stored as a JSON document in the
/// repository's metadata table
#[derive(Debug, Serialize, Deserialize)]
struct StreamMeta {
    timestamp_path: String,
}

/// One member submitted for ingestion
#[derive(Debug, Clone)]
pub struct IngestRecord {
    /// Stream the member belongs to
    pub stream_id: String,
    /// Globally unique member identifier
    pub member_id: String,
    /// Serialized member representation
    pub payload: String,
    /// Extracted timestamp, ms since epoch, if the member carries one
    pub timestamp: Option<i64>,
    /// Externally decided bucket assignments, if any
    pub buckets: Vec<String>,
}

impl IngestRecord {
    pub fn new(
        stream_id: impl Into<String>,
        member_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            member_id: member_id.into(),
            payload: payload.into(),
            timestamp: None,
            buckets: Vec::new(),
        }
    }

    /// Builder method: set the timestamp
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Builder method: set the bucket assignments
    pub fn buckets(mut self, buckets: Vec<String>) -> Self {
        self.buckets = buckets;
        self
    }
}

/// What happened to one ingestion batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Members submitted
    pub received: usize,
    /// Members seen before; payload kept, indexing skipped
    pub duplicates: usize,
    /// Members placed by the time-partitioned engine
    pub indexed: usize,
    /// Members placed through externally assigned buckets
    pub bucketed: usize,
    /// Members dropped from the index (out of order or sealed window)
    pub rejected: usize,
    /// Members persisted but placed nowhere (no timestamp, no buckets)
    pub unplaced: usize,
    /// Fragments sealed by the post-batch sweep
    pub sealed: u64,
}

impl std::fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received: {}, indexed: {}, bucketed: {}, duplicates: {}, rejected: {}, unplaced: {}, sealed: {}",
            self.received,
            self.indexed,
            self.bucketed,
            self.duplicates,
            self.rejected,
            self.unplaced,
            self.sealed
        )
    }
}

/// The write-side entry point: payload persistence, dispatch, sweeping.
pub struct Ingester {
    repository: Arc<dyn Repository>,
    time: TimeFragmenter,
    buckets: BucketStrategy,
    sweeper: Sweeper,
    /// Registered timestamp property per stream
    timestamp_paths: RwLock<HashMap<String, String>>,
    /// Member ids already dispatched this process; the persisted record store
    /// remains the authority across restarts
    seen: Mutex<HashSet<String>>,
    /// Per-stream writer serialization
    stream_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Ingester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingester").finish_non_exhaustive()
    }
}

impl Ingester {
    /// Build an ingester over `repository`, restoring stream registrations
    /// persisted by earlier runs.
    pub async fn new(
        repository: Arc<dyn Repository>,
        config: FragmentationConfig,
    ) -> IngestResult<Self> {
        if config.k < 2 {
            return Err(IngestError::Config(format!(
                "branching factor k must be at least 2, got {}",
                config.k
            )));
        }
        if config.max_size == 0 {
            return Err(IngestError::Config(
                "max_size must be at least 1".to_string(),
            ));
        }

        let mut timestamp_paths = HashMap::new();
        for (stream, raw) in repository.list_meta(STREAM_META_KIND).await? {
            let meta: StreamMeta =
                serde_json::from_str(&raw).map_err(RepositoryError::from)?;
            timestamp_paths.insert(stream, meta.timestamp_path);
        }
        tracing::info!(
            streams = timestamp_paths.len(),
            max_size = config.max_size,
            k = config.k,
            min_bucket_span_secs = config.min_bucket_span_secs,
            "ingester ready"
        );

        Ok(Self {
            time: TimeFragmenter::new(repository.clone(), config),
            buckets: BucketStrategy::new(repository.clone()),
            sweeper: Sweeper::new(repository.clone()),
            repository,
            timestamp_paths: RwLock::new(timestamp_paths),
            seen: Mutex::new(HashSet::new()),
            stream_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Register a stream's timestamp property. Members of the stream that
    /// carry a timestamp are placed by the time-partitioned engine from here
    /// on. The registration is persisted and survives restarts.
    pub async fn register_stream(
        &self,
        stream_id: &str,
        timestamp_path: &str,
    ) -> IngestResult<()> {
        let meta = StreamMeta {
            timestamp_path: timestamp_path.to_string(),
        };
        let raw = serde_json::to_string(&meta).map_err(RepositoryError::from)?;
        self.repository
            .put_meta(STREAM_META_KIND, stream_id, &raw)
            .await?;
        self.timestamp_paths
            .write()
            .await
            .insert(stream_id.to_string(), timestamp_path.to_string());
        tracing::info!(stream = stream_id, path = timestamp_path, "stream registered");
        Ok(())
    }

    /// The registered timestamp property of a stream, if any
    pub async fn timestamp_path(&self, stream_id: &str) -> Option<String> {
        self.timestamp_paths.read().await.get(stream_id).cloned()
    }

    /// Ingest one batch of members.
    ///
    /// The batch is processed in timestamp order so intra-batch arrival
    /// order cannot make a member look out of date. A failure on one member
    /// aborts the batch with the already processed members durably applied.
    pub async fn ingest(&self, mut batch: Vec<IngestRecord>) -> IngestResult<IngestSummary> {
        let mut summary = IngestSummary {
            received: batch.len(),
            ..IngestSummary::default()
        };
        batch.sort_by_key(|r| r.timestamp.unwrap_or(i64::MAX));

        let mut high_water: HashMap<String, i64> = HashMap::new();
        for record in batch {
            if !self.persist_record(&record).await? {
                summary.duplicates += 1;
                continue;
            }

            let lock = self.stream_lock(&record.stream_id).await;
            let _guard = lock.lock().await;
            self.dispatch(&record, &mut summary, &mut high_water).await?;
        }

        for (stream, t_max) in high_water {
            summary.sealed += self.sweeper.sweep(&stream, t_max).await?;
        }
        tracing::info!(%summary, "batch ingested");
        Ok(summary)
    }

    /// Persist the payload if the member is new. Returns false for a
    /// duplicate, which is then excluded from indexing.
    ///
    /// The seen-set is only populated once the record store confirms the
    /// member, so a failed storage call never caches an id; the retried
    /// batch goes back through the authoritative existence check.
    async fn persist_record(&self, record: &IngestRecord) -> IngestResult<bool> {
        if self.seen.lock().await.contains(&record.member_id) {
            return Ok(false);
        }
        if self.repository.record_exists(&record.member_id).await? {
            tracing::debug!(member = %record.member_id, "duplicate member, keeping first payload");
            self.seen.lock().await.insert(record.member_id.clone());
            return Ok(false);
        }
        let mut stored = MemberRecord::new(&record.member_id, &record.payload);
        stored.timestamp = record.timestamp;
        self.repository.put_record(&stored).await?;
        self.seen.lock().await.insert(record.member_id.clone());
        Ok(true)
    }

    async fn dispatch(
        &self,
        record: &IngestRecord,
        summary: &mut IngestSummary,
        high_water: &mut HashMap<String, i64>,
    ) -> IngestResult<()> {
        let path = self.timestamp_path(&record.stream_id).await;

        if let (Some(timestamp), Some(path)) = (record.timestamp, path.as_deref()) {
            let outcome = self
                .time
                .insert(&record.stream_id, path, timestamp, &record.member_id)
                .await?;
            match outcome {
                InsertOutcome::Rejected(_) => summary.rejected += 1,
                _ => summary.indexed += 1,
            }
            if !matches!(outcome, InsertOutcome::Rejected(_)) {
                let mark = high_water.entry(record.stream_id.clone()).or_insert(timestamp);
                *mark = (*mark).max(timestamp);
            }
            return Ok(());
        }

        if record.timestamp.is_some() {
            tracing::warn!(
                stream = %record.stream_id,
                member = %record.member_id,
                "member has a timestamp but its stream has no registered timestamp path"
            );
        }

        if !record.buckets.is_empty() {
            self.buckets
                .add_member(&record.stream_id, &record.member_id, &record.buckets)
                .await?;
            summary.bucketed += 1;
        } else {
            tracing::warn!(
                stream = %record.stream_id,
                member = %record.member_id,
                "member has no placement information, payload persisted only"
            );
            summary.unplaced += 1;
        }
        Ok(())
    }

    /// Create-or-patch an externally described bucket
    pub async fn apply_bucket(&self, stream_id: &str, update: BucketUpdate) -> IngestResult<()> {
        self.buckets.upsert_bucket(stream_id, update).await
    }

    /// Set-add an externally described navigation edge
    pub async fn apply_relation(&self, relation: &Relation) -> IngestResult<()> {
        self.buckets.upsert_relation(relation).await
    }

    /// Retract externally described navigation edges; returns how many matched
    pub async fn retract_relation(&self, relation: &Relation) -> IngestResult<u64> {
        self.buckets.remove_relation(relation).await
    }

    async fn stream_lock(&self, stream_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.stream_locks.lock().await;
        locks
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fragment;
    use crate::repository::{
        FragmentPatch, IndexMutation, MemoryRepository, RepoResult,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PATH: &str = "http://www.w3.org/ns/sosa/resultTime";
    // 2024-03-01T00:00:00Z
    const BASE: i64 = 1_709_251_200_000;

    async fn ingester(repo: &Arc<MemoryRepository>) -> Ingester {
        let config = FragmentationConfig {
            max_size: 10,
            k: 4,
            min_bucket_span_secs: 300,
        };
        let ingester = Ingester::new(repo.clone() as Arc<dyn Repository>, config)
            .await
            .unwrap();
        ingester.register_stream("s", PATH).await.unwrap();
        ingester
    }

    #[tokio::test]
    async fn test_batch_sorted_by_timestamp() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = ingester(&repo).await;

        // reverse arrival order; sorting prevents spurious rejections
        let batch: Vec<_> = (0..5)
            .rev()
            .map(|i| IngestRecord::new("s", format!("m{i}"), "p").timestamp(BASE + i * 1000))
            .collect();
        let summary = engine.ingest(batch).await.unwrap();
        assert_eq!(summary.indexed, 5);
        assert_eq!(summary.rejected, 0);

        let fragments = repo.stream_fragments("s").await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].count, 5);
    }

    #[tokio::test]
    async fn test_duplicates_are_skipped_but_payload_kept() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = ingester(&repo).await;

        let first = engine
            .ingest(vec![IngestRecord::new("s", "m0", "original").timestamp(BASE)])
            .await
            .unwrap();
        assert_eq!(first.indexed, 1);

        let second = engine
            .ingest(vec![IngestRecord::new("s", "m0", "changed").timestamp(BASE + 1)])
            .await
            .unwrap();
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.indexed, 0);

        let fragments = repo.stream_fragments("s").await;
        assert_eq!(fragments[0].count, 1);
        assert!(repo.record_exists("m0").await.unwrap());
    }

    #[tokio::test]
    async fn test_bucket_fallback_for_unregistered_stream() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = ingester(&repo).await;

        let summary = engine
            .ingest(vec![IngestRecord::new("other", "m0", "p")
                .timestamp(BASE)
                .buckets(vec!["a".to_string()])])
            .await
            .unwrap();
        assert_eq!(summary.bucketed, 1);
        assert_eq!(summary.indexed, 0);

        let fragments = repo.stream_fragments("other").await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].id, "a");
        assert!(fragments[0].window.is_none());
    }

    #[tokio::test]
    async fn test_unplaced_member_is_persisted_only() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = ingester(&repo).await;

        let summary = engine
            .ingest(vec![IngestRecord::new("s", "m0", "p")])
            .await
            .unwrap();
        assert_eq!(summary.unplaced, 1);
        assert!(repo.record_exists("m0").await.unwrap());
        assert!(repo.stream_fragments("s").await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_runs_after_batch() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = ingester(&repo).await;

        let late = BASE + crate::model::YEAR_MS;
        let summary = engine
            .ingest(vec![
                IngestRecord::new("s", "m0", "p").timestamp(BASE),
                IngestRecord::new("s", "m1", "p").timestamp(late),
            ])
            .await
            .unwrap();
        // the earlier year root fully elapsed once the next year arrived
        assert_eq!(summary.sealed, 1);

        let fragments = repo.stream_fragments("s").await;
        let sealed: Vec<_> = fragments.iter().filter(|f| f.immutable).collect();
        assert_eq!(sealed.len(), 1);
        assert!(sealed[0].window.unwrap().contains(BASE));
    }

    #[tokio::test]
    async fn test_stream_registration_survives_restart() {
        let repo = Arc::new(MemoryRepository::new());
        {
            let engine = ingester(&repo).await;
            let _ = engine;
        }

        let config = FragmentationConfig::default();
        let revived = Ingester::new(repo.clone() as Arc<dyn Repository>, config)
            .await
            .unwrap();
        assert_eq!(revived.timestamp_path("s").await.as_deref(), Some(PATH));
    }

    /// Delegates to an in-memory store but fails the next `failing_puts`
    /// record writes, simulating a transient backend outage.
    struct FlakyRepository {
        inner: MemoryRepository,
        failing_puts: AtomicUsize,
    }

    impl FlakyRepository {
        fn new(failing_puts: usize) -> Self {
            Self {
                inner: MemoryRepository::new(),
                failing_puts: AtomicUsize::new(failing_puts),
            }
        }
    }

    #[async_trait]
    impl Repository for FlakyRepository {
        async fn find_candidate(
            &self,
            stream_id: &str,
            timestamp: i64,
        ) -> RepoResult<Option<Fragment>> {
            self.inner.find_candidate(stream_id, timestamp).await
        }

        async fn insert_member(
            &self,
            stream_id: &str,
            fragment_id: &str,
            member_id: &str,
        ) -> RepoResult<()> {
            self.inner.insert_member(stream_id, fragment_id, member_id).await
        }

        async fn create_fragment(&self, fragment: &Fragment) -> RepoResult<()> {
            self.inner.create_fragment(fragment).await
        }

        async fn create_fragments(&self, fragments: &[Fragment]) -> RepoResult<()> {
            self.inner.create_fragments(fragments).await
        }

        async fn update_fragment(
            &self,
            stream_id: &str,
            fragment_id: &str,
            patch: FragmentPatch,
        ) -> RepoResult<()> {
            self.inner.update_fragment(stream_id, fragment_id, patch).await
        }

        async fn upsert_bucket(
            &self,
            stream_id: &str,
            bucket_id: &str,
            patch: FragmentPatch,
        ) -> RepoResult<()> {
            self.inner.upsert_bucket(stream_id, bucket_id, patch).await
        }

        async fn add_member_to_bucket(
            &self,
            stream_id: &str,
            bucket_id: &str,
            member_id: &str,
        ) -> RepoResult<()> {
            self.inner
                .add_member_to_bucket(stream_id, bucket_id, member_id)
                .await
        }

        async fn members_by_timestamp(
            &self,
            member_ids: &[String],
        ) -> RepoResult<Vec<(String, i64)>> {
            self.inner.members_by_timestamp(member_ids).await
        }

        async fn append_relations(&self, relations: &[Relation]) -> RepoResult<()> {
            self.inner.append_relations(relations).await
        }

        async fn remove_relations(
            &self,
            relation: &Relation,
            match_path: Option<&str>,
            match_value: Option<&str>,
        ) -> RepoResult<u64> {
            self.inner
                .remove_relations(relation, match_path, match_value)
                .await
        }

        async fn count_fragments(&self, stream_id: &str) -> RepoResult<u64> {
            self.inner.count_fragments(stream_id).await
        }

        async fn record_exists(&self, member_id: &str) -> RepoResult<bool> {
            self.inner.record_exists(member_id).await
        }

        async fn put_record(&self, record: &MemberRecord) -> RepoResult<()> {
            if self.failing_puts.load(Ordering::SeqCst) > 0 {
                self.failing_puts.fetch_sub(1, Ordering::SeqCst);
                return Err(RepositoryError::Backend("connection reset".to_string()));
            }
            self.inner.put_record(record).await
        }

        async fn sweep_immutable(&self, stream_id: &str, t_max: i64) -> RepoResult<u64> {
            self.inner.sweep_immutable(stream_id, t_max).await
        }

        async fn apply(&self, mutations: Vec<IndexMutation>) -> RepoResult<()> {
            self.inner.apply(mutations).await
        }

        async fn put_meta(&self, kind: &str, id: &str, value: &str) -> RepoResult<()> {
            self.inner.put_meta(kind, id, value).await
        }

        async fn get_meta(&self, kind: &str, id: &str) -> RepoResult<Option<String>> {
            self.inner.get_meta(kind, id).await
        }

        async fn list_meta(&self, kind: &str) -> RepoResult<Vec<(String, String)>> {
            self.inner.list_meta(kind).await
        }
    }

    #[tokio::test]
    async fn test_failed_record_write_is_retryable() {
        let repo = Arc::new(FlakyRepository::new(1));
        let config = FragmentationConfig {
            max_size: 10,
            k: 4,
            min_bucket_span_secs: 300,
        };
        let engine = Ingester::new(repo.clone() as Arc<dyn Repository>, config)
            .await
            .unwrap();
        engine.register_stream("s", PATH).await.unwrap();

        let batch = vec![IngestRecord::new("s", "m0", "p").timestamp(BASE)];
        assert!(engine.ingest(batch.clone()).await.is_err());
        assert!(!repo.record_exists("m0").await.unwrap());

        // the retried member is new, not a duplicate: the failed write must
        // not have left it cached as already seen
        let summary = engine.ingest(batch).await.unwrap();
        assert_eq!(summary.indexed, 1);
        assert_eq!(summary.duplicates, 0);
        assert!(repo.record_exists("m0").await.unwrap());
        assert_eq!(repo.inner.stream_fragments("s").await.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_stream_meta_fails_startup() {
        let repo = Arc::new(MemoryRepository::new());
        repo.put_meta("stream", "s", "not json").await.unwrap();

        let err = Ingester::new(repo as Arc<dyn Repository>, FragmentationConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Repository(RepositoryError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let repo = Arc::new(MemoryRepository::new());
        let config = FragmentationConfig {
            max_size: 10,
            k: 1,
            min_bucket_span_secs: 300,
        };
        let err = Ingester::new(repo as Arc<dyn Repository>, config)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }
}
