//! Time-partitioned insertion engine
//!
//! Places one member with a known timestamp into the fragment tree of its
//! stream: locate the candidate fragment, then either append in place,
//! split the fragment k ways into smaller time windows, or paginate once the
//! window span has bottomed out at the configured floor.
//!
//! A split loads the member timestamps once, recurses over the loaded rows
//! in memory, and emits its whole effect (sub-fragments or pagination
//! sibling, navigation relations, the cleared/truncated parent) as a single
//! batched repository write.

use crate::config::FragmentationConfig;
use crate::ingest::error::{IngestError, IngestResult};
use crate::model::{iso_millis, year_of, Fragment, Relation, RelationType, TimeWindow};
use crate::repository::{FragmentPatch, IndexMutation, Repository};
use std::sync::Arc;

/// What happened to a member during temporal insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Appended to an existing leaf with room to spare
    Appended,
    /// A new per-year root fragment was created for it
    RootCreated,
    /// The candidate was full and was split into k sub-fragments
    Split,
    /// The candidate was full at the minimum span and overflowed into a new page
    Paginated,
    /// The member was dropped from indexing
    Rejected(RejectReason),
}

/// Why a member was dropped from indexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Older than every fragment already indexed for the stream
    OlderThanIndex,
    /// Falls into a window that has already been sealed
    ImmutableWindow,
}

/// One fragment being produced or rewritten during a split
struct SplitNode {
    id: String,
    window: TimeWindow,
    /// Whether a row for this fragment already exists in the index
    persisted: bool,
    immutable: bool,
    root: bool,
}

/// The time-partitioned insertion engine
pub struct TimeFragmenter {
    repository: Arc<dyn Repository>,
    config: FragmentationConfig,
}

impl TimeFragmenter {
    pub fn new(repository: Arc<dyn Repository>, config: FragmentationConfig) -> Self {
        Self { repository, config }
    }

    /// Insert one member into the temporal index of `stream_id`.
    ///
    /// `path` is the stream's timestamp property, carried on the comparison
    /// relations emitted by splits. The caller must serialize calls per
    /// stream; candidate lookup and mutation are not atomic across steps.
    pub async fn insert(
        &self,
        stream_id: &str,
        path: &str,
        timestamp: i64,
        member_id: &str,
    ) -> IngestResult<InsertOutcome> {
        let candidate = self.repository.find_candidate(stream_id, timestamp).await?;

        let Some(candidate) = candidate else {
            if self.repository.count_fragments(stream_id).await? > 0 {
                // out-of-order arrival older than everything already indexed;
                // do not fabricate a fragment for the past
                tracing::warn!(
                    stream = stream_id,
                    member = member_id,
                    timestamp,
                    "member predates the stream's index, dropping from index"
                );
                return Ok(InsertOutcome::Rejected(RejectReason::OlderThanIndex));
            }
            return self.create_year_root(stream_id, timestamp, member_id).await;
        };

        let window = candidate
            .window
            .ok_or_else(|| IngestError::CorruptIndex(format!("candidate {} has no time window", candidate.id)))?;

        // top-level partitioning is year-granular: a later year always opens
        // a fresh root, regardless of k or max_size
        let member_year = year_of(timestamp).ok_or(IngestError::InvalidTimestamp(timestamp))?;
        let candidate_year =
            year_of(window.start).ok_or(IngestError::InvalidTimestamp(window.start))?;
        if member_year > candidate_year {
            return self.create_year_root(stream_id, timestamp, member_id).await;
        }

        if candidate.immutable {
            tracing::warn!(
                stream = stream_id,
                member = member_id,
                fragment = %candidate.id,
                timestamp,
                "member targets a sealed window, dropping from index"
            );
            return Ok(InsertOutcome::Rejected(RejectReason::ImmutableWindow));
        }

        if candidate.count < self.config.max_size {
            self.repository
                .insert_member(stream_id, &candidate.id, member_id)
                .await?;
            return Ok(InsertOutcome::Appended);
        }

        self.split(stream_id, path, candidate, window, member_id, timestamp)
            .await
    }

    async fn create_year_root(
        &self,
        stream_id: &str,
        timestamp: i64,
        member_id: &str,
    ) -> IngestResult<InsertOutcome> {
        let window =
            TimeWindow::year_containing(timestamp).ok_or(IngestError::InvalidTimestamp(timestamp))?;
        let fragment = Fragment::temporal(stream_id, window)
            .root()
            .members(vec![member_id.to_string()]);
        tracing::debug!(
            stream = stream_id,
            fragment = %fragment.id,
            "creating year root fragment"
        );
        self.repository.create_fragment(&fragment).await?;
        Ok(InsertOutcome::RootCreated)
    }

    /// Split a full fragment, with the new member included.
    async fn split(
        &self,
        stream_id: &str,
        path: &str,
        fragment: Fragment,
        window: TimeWindow,
        member_id: &str,
        timestamp: i64,
    ) -> IngestResult<InsertOutcome> {
        let mut rows = self
            .repository
            .members_by_timestamp(&fragment.members)
            .await?;
        rows.push((member_id.to_string(), timestamp));
        rows.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));

        if rows.len() <= self.config.max_size {
            // the record store no longer yields a timestamp for every member;
            // splitting would silently drop the difference
            return Err(IngestError::MissingTimestamps(fragment.id));
        }

        let node = SplitNode {
            id: fragment.id,
            window,
            persisted: true,
            immutable: fragment.immutable,
            root: fragment.root,
        };

        let mut batch = Vec::new();
        let outcome = self.split_rows(&mut batch, stream_id, path, node, rows)?;
        self.repository.apply(batch).await?;
        Ok(outcome)
    }

    /// Distribute already-loaded `(member, timestamp)` rows out of an
    /// overflowing node, recursing while any product still overflows.
    /// Mutations accumulate into `batch`; nothing is persisted here.
    fn split_rows(
        &self,
        batch: &mut Vec<IndexMutation>,
        stream_id: &str,
        path: &str,
        node: SplitNode,
        rows: Vec<(String, i64)>,
    ) -> IngestResult<InsertOutcome> {
        let new_span = node.window.child_span(self.config.k);
        if new_span < self.config.min_span_ms() {
            self.paginate_rows(batch, stream_id, node, rows)
        } else {
            self.subdivide_rows(batch, stream_id, path, node, rows)
        }
    }

    /// Pagination branch: the time resolution has bottomed out, so overflow
    /// chains into a sibling at the same window with the next page index.
    fn paginate_rows(
        &self,
        batch: &mut Vec<IndexMutation>,
        stream_id: &str,
        node: SplitNode,
        rows: Vec<(String, i64)>,
    ) -> IngestResult<InsertOutcome> {
        let max_size = self.config.max_size;
        let (keep, overflow) = rows.split_at(max_size);
        let keep_ids: Vec<String> = keep.iter().map(|(id, _)| id.clone()).collect();

        let sibling_window = node.window.next_page();
        let sibling_id = sibling_window.fragment_id(stream_id);
        tracing::debug!(
            stream = stream_id,
            fragment = %node.id,
            sibling = %sibling_id,
            overflow = overflow.len(),
            "paginating fragment at minimum span"
        );

        batch.push(IndexMutation::AppendRelation(Relation::new(
            stream_id,
            node.id.clone(),
            sibling_id.clone(),
            RelationType::Relation,
        )));

        // the node keeps the first max_size members in timestamp order
        if node.persisted {
            batch.push(IndexMutation::PatchFragment {
                stream_id: stream_id.to_string(),
                fragment_id: node.id,
                patch: FragmentPatch::new().members(keep_ids),
            });
        } else {
            let fragment = Fragment {
                id: node.id,
                stream_id: stream_id.to_string(),
                window: Some(node.window),
                members: Vec::new(),
                count: 0,
                immutable: node.immutable,
                root: node.root,
            }
            .members(keep_ids);
            batch.push(IndexMutation::CreateFragment(fragment));
        }

        let sibling = SplitNode {
            id: sibling_id,
            window: sibling_window,
            persisted: false,
            immutable: false,
            root: false,
        };
        if overflow.len() > self.config.max_size {
            // keep chaining pages until every sibling fits
            let _ = self.paginate_rows(batch, stream_id, sibling, overflow.to_vec())?;
        } else {
            let members: Vec<String> = overflow.iter().map(|(id, _)| id.clone()).collect();
            batch.push(IndexMutation::CreateFragment(
                Fragment::temporal(stream_id, sibling_window).members(members),
            ));
        }
        Ok(InsertOutcome::Paginated)
    }

    /// Temporal branch: subdivide the window k ways and redistribute.
    fn subdivide_rows(
        &self,
        batch: &mut Vec<IndexMutation>,
        stream_id: &str,
        path: &str,
        node: SplitNode,
        rows: Vec<(String, i64)>,
    ) -> IngestResult<InsertOutcome> {
        let k = self.config.k;
        let children = node.window.children(k);
        tracing::debug!(
            stream = stream_id,
            fragment = %node.id,
            span = node.window.span,
            child_span = node.window.child_span(k),
            "splitting fragment into {} sub-fragments",
            k
        );

        // each member lands in exactly one half-open child interval
        let mut buckets: Vec<Vec<(String, i64)>> = vec![Vec::new(); k as usize];
        for (member, ts) in rows {
            buckets[node.window.child_index(k, ts)].push((member, ts));
        }

        for (child_window, child_rows) in children.into_iter().zip(buckets) {
            let child_id = child_window.fragment_id(stream_id);

            batch.push(IndexMutation::AppendRelation(
                Relation::new(
                    stream_id,
                    node.id.clone(),
                    child_id.clone(),
                    RelationType::GreaterThanOrEqualTo,
                )
                .value(iso_millis(child_window.start))
                .path(path),
            ));
            batch.push(IndexMutation::AppendRelation(
                Relation::new(stream_id, node.id.clone(), child_id.clone(), RelationType::LessThan)
                    .value(iso_millis(child_window.end()))
                    .path(path),
            ));

            if child_rows.len() > self.config.max_size {
                // resolve the overflow before anything is persisted
                let child = SplitNode {
                    id: child_id,
                    window: child_window,
                    persisted: false,
                    immutable: false,
                    root: false,
                };
                let _ = self.split_rows(batch, stream_id, path, child, child_rows)?;
            } else {
                let members: Vec<String> = child_rows.into_iter().map(|(id, _)| id).collect();
                batch.push(IndexMutation::CreateFragment(
                    Fragment::temporal(stream_id, child_window).members(members),
                ));
            }
        }

        // the node becomes a routing fragment: empty, identity retained
        if node.persisted {
            batch.push(IndexMutation::PatchFragment {
                stream_id: stream_id.to_string(),
                fragment_id: node.id,
                patch: FragmentPatch::new().clear_members(),
            });
        } else {
            let fragment = Fragment {
                id: node.id,
                stream_id: stream_id.to_string(),
                window: Some(node.window),
                members: Vec::new(),
                count: 0,
                immutable: node.immutable,
                root: node.root,
            };
            batch.push(IndexMutation::CreateFragment(fragment));
        }
        Ok(InsertOutcome::Split)
    }
}
