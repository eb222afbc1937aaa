//! Core data types for the fragtree index
//!
//! This module defines the fundamental types shared by the insertion engines
//! and the repository backends:
//! - `MemberRecord`: an ingested member (opaque payload + optional timestamp)
//! - `TimeWindow`: the half-open time range `[start, start+span)` of a fragment
//! - `Fragment`: a node in the fragmentation tree (temporal or bucket-assigned)
//! - `Relation`: a directed hypermedia navigation edge between fragments

use chrono::{DateTime, Datelike, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Span of a root fragment: one year in milliseconds.
pub const YEAR_MS: i64 = 31_536_000_000;

/// A single ingested member: opaque serialized payload plus the timestamp
/// extracted from it, if any.
///
/// Records are append-only and deduplicated by `id`; they are never mutated
/// or deleted by this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberRecord {
    /// Globally unique member identifier (typically a URI)
    pub id: String,
    /// Serialized representation of the member (opaque to the index)
    pub payload: String,
    /// Partition key: the point in time associated with the member, ms since epoch
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl MemberRecord {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            timestamp: None,
        }
    }

    /// Builder method: set the timestamp
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// The time range a temporal fragment covers: half-open `[start, start+span)`,
/// plus the pagination index distinguishing overflow siblings that share the
/// same range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive lower bound, ms since epoch
    pub start: i64,
    /// Duration covered, in ms
    pub span: i64,
    /// 0 for the primary fragment, incremented for paginated overflow siblings
    pub page: u32,
}

impl TimeWindow {
    pub fn new(start: i64, span: i64, page: u32) -> Self {
        Self { start, span, page }
    }

    /// The calendar-year window containing `ts_ms`, at page 0.
    ///
    /// Returns `None` for timestamps outside chrono's representable range.
    pub fn year_containing(ts_ms: i64) -> Option<Self> {
        let year = year_of(ts_ms)?;
        let start = Utc
            .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
            .single()?
            .timestamp_millis();
        Some(Self::new(start, YEAR_MS, 0))
    }

    /// Exclusive upper bound
    pub fn end(&self) -> i64 {
        self.start + self.span
    }

    /// Half-open containment check: lower bound inclusive, upper exclusive
    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start && ts_ms < self.end()
    }

    /// True once the whole range lies strictly before `t_max`
    pub fn elapsed_by(&self, t_max: i64) -> bool {
        self.end() < t_max
    }

    /// The overflow sibling window: same range, next page
    pub fn next_page(&self) -> Self {
        Self::new(self.start, self.span, self.page + 1)
    }

    /// Span of the children produced by a k-way split
    pub fn child_span(&self, k: u32) -> i64 {
        self.span / k as i64
    }

    /// The k sub-windows of a temporal split, each at page 0.
    ///
    /// All children get span `span / k`; the last child absorbs the integer
    /// division remainder so the k half-open intervals partition this window
    /// exactly.
    pub fn children(&self, k: u32) -> Vec<Self> {
        let k = k as i64;
        let child_span = self.span / k;
        (0..k)
            .map(|i| {
                let start = self.start + i * child_span;
                let span = if i == k - 1 {
                    self.end() - start
                } else {
                    child_span
                };
                Self::new(start, span, 0)
            })
            .collect()
    }

    /// Which child of a k-way split holds `ts_ms`.
    ///
    /// Assumes `self.contains(ts_ms)`; timestamps in the remainder tail of the
    /// window map to the last child.
    pub fn child_index(&self, k: u32, ts_ms: i64) -> usize {
        let idx = (ts_ms - self.start) / self.child_span(k);
        (idx as usize).min(k as usize - 1)
    }

    /// Deterministic fragment identifier for this window within a stream
    pub fn fragment_id(&self, stream_id: &str) -> String {
        format!("{}/{}-{}-{}", stream_id, self.start, self.span, self.page)
    }
}

/// A node in the fragmentation tree.
///
/// Temporal fragments carry a `TimeWindow` and are managed by the
/// time-partitioned insertion engine; bucket-assigned fragments have no
/// window and are filled by the bucket-strategy engine. Fragments are never
/// deleted; a split turns a leaf into a routing node by clearing its members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fragment {
    /// Fragment identifier, unique within the stream
    pub id: String,
    /// Owning stream
    pub stream_id: String,
    /// Time range for temporal fragments; `None` for external buckets
    #[serde(default)]
    pub window: Option<TimeWindow>,
    /// Member ids currently assigned to this fragment
    #[serde(default)]
    pub members: Vec<String>,
    /// Cached cardinality of `members`; must always equal `members.len()`
    pub count: usize,
    /// True once the fragment's time range has fully elapsed; no further inserts
    pub immutable: bool,
    /// True only for the top-level per-year fragment
    pub root: bool,
}

impl Fragment {
    /// A new empty temporal fragment for `window`
    pub fn temporal(stream_id: impl Into<String>, window: TimeWindow) -> Self {
        let stream_id = stream_id.into();
        Self {
            id: window.fragment_id(&stream_id),
            stream_id,
            window: Some(window),
            members: Vec::new(),
            count: 0,
            immutable: false,
            root: false,
        }
    }

    /// A new empty bucket fragment with an externally supplied identifier
    pub fn bucket(stream_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            window: None,
            members: Vec::new(),
            count: 0,
            immutable: false,
            root: false,
        }
    }

    /// Builder method: mark as root
    pub fn root(mut self) -> Self {
        self.root = true;
        self
    }

    /// Builder method: set the member list (keeps `count` in sync)
    pub fn members(mut self, members: Vec<String>) -> Self {
        self.count = members.len();
        self.members = members;
        self
    }
}

/// Navigation edge types, after the TREE vocabulary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RelationType {
    /// Members of the target have timestamps >= the relation value
    GreaterThanOrEqualTo,
    /// Members of the target have timestamps < the relation value
    LessThan,
    /// Untyped pagination continuation, no comparison value
    Relation,
}

impl RelationType {
    /// The TREE vocabulary term for this relation type
    pub fn as_term(&self) -> &'static str {
        match self {
            RelationType::GreaterThanOrEqualTo => {
                "https://w3id.org/tree#GreaterThanOrEqualToRelation"
            }
            RelationType::LessThan => "https://w3id.org/tree#LessThanRelation",
            RelationType::Relation => "https://w3id.org/tree#Relation",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_term())
    }
}

/// A directed hypermedia edge between two fragments of a stream.
///
/// Created when a fragment is split or paginated, or materialized from an
/// externally supplied bucket graph. Append-only; identical edges collapse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    /// Owning stream
    pub stream_id: String,
    /// Source fragment id
    pub from: String,
    /// Target fragment id
    pub bucket: String,
    /// Edge type
    pub relation_type: RelationType,
    /// Serialized comparison value (the time boundary, for temporal relations)
    #[serde(default)]
    pub value: Option<String>,
    /// Serialized reference to the property the comparison applies to
    #[serde(default)]
    pub path: Option<String>,
}

impl Relation {
    pub fn new(
        stream_id: impl Into<String>,
        from: impl Into<String>,
        bucket: impl Into<String>,
        relation_type: RelationType,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            from: from.into(),
            bucket: bucket.into(),
            relation_type,
            value: None,
            path: None,
        }
    }

    /// Builder method: set the comparison value
    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Builder method: set the comparison path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Identity used for add-to-set deduplication
    pub fn edge_key(&self) -> (&str, &str, &str, RelationType, Option<&str>, Option<&str>) {
        (
            &self.stream_id,
            &self.from,
            &self.bucket,
            self.relation_type,
            self.value.as_deref(),
            self.path.as_deref(),
        )
    }
}

/// Calendar year containing `ts_ms`, or `None` outside chrono's range
pub fn year_of(ts_ms: i64) -> Option<i32> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms).map(|dt| dt.year())
}

/// Render a millisecond timestamp as an ISO-8601 string for relation values
pub fn iso_millis(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ts_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_containment_is_half_open() {
        let w = TimeWindow::new(1000, 500, 0);
        assert!(w.contains(1000));
        assert!(w.contains(1499));
        assert!(!w.contains(1500));
        assert!(!w.contains(999));
    }

    #[test]
    fn test_children_partition_exactly() {
        // span not divisible by k: the last child absorbs the remainder
        let children = TimeWindow::new(0, 10, 0).children(4);
        assert_eq!(children.len(), 4);
        assert_eq!(children[0].start, 0);
        assert_eq!(children[0].span, 2);
        assert_eq!(children[3].start, 6);
        assert_eq!(children[3].span, 4);
        assert_eq!(children[3].end(), 10);

        // every timestamp of the parent lands in exactly one child
        for ts in 0..10 {
            let holding: Vec<_> = children.iter().filter(|c| c.contains(ts)).collect();
            assert_eq!(holding.len(), 1, "ts {} held by {} children", ts, holding.len());
        }
    }

    #[test]
    fn test_child_index_matches_children() {
        let w = TimeWindow::new(100, 37, 0);
        let children = w.children(4);
        for ts in 100..137 {
            let idx = w.child_index(4, ts);
            assert!(
                children[idx].contains(ts),
                "ts {} routed to child {} {:?}",
                ts,
                idx,
                children[idx]
            );
        }
    }

    #[test]
    fn test_child_index_boundary_goes_to_starting_child() {
        let w = TimeWindow::new(0, 400, 0);
        let children = w.children(4);
        // a member exactly at a sub-fragment boundary belongs to the child
        // starting there, never the preceding one
        assert_eq!(w.child_index(4, children[1].start), 1);
        assert_eq!(w.child_index(4, children[2].start), 2);
        assert_eq!(w.child_index(4, children[1].start - 1), 0);
    }

    #[test]
    fn test_year_window() {
        // 2024-06-15T12:00:00Z
        let ts = 1_718_452_800_000;
        let w = TimeWindow::year_containing(ts).unwrap();
        assert_eq!(w.span, YEAR_MS);
        assert_eq!(w.page, 0);
        assert!(w.contains(ts));
        assert_eq!(year_of(w.start), Some(2024));
        // Jan 1st belongs to its own year window
        assert!(TimeWindow::year_containing(w.start).unwrap().contains(w.start));
    }

    #[test]
    fn test_fragment_id_is_deterministic() {
        let w = TimeWindow::new(1000, 500, 2);
        assert_eq!(w.fragment_id("s"), "s/1000-500-2");
        assert_eq!(w.fragment_id("s"), w.fragment_id("s"));
        assert_ne!(w.fragment_id("s"), w.next_page().fragment_id("s"));
    }

    #[test]
    fn test_fragment_builder_keeps_count_in_sync() {
        let f = Fragment::temporal("s", TimeWindow::new(0, 10, 0))
            .members(vec!["a".into(), "b".into()]);
        assert_eq!(f.count, 2);
        assert_eq!(f.count, f.members.len());
    }

    #[test]
    fn test_relation_edge_key_dedup_identity() {
        let a = Relation::new("s", "f", "b", RelationType::LessThan).value("v");
        let b = Relation::new("s", "f", "b", RelationType::LessThan).value("v");
        let c = Relation::new("s", "f", "b", RelationType::LessThan).value("w");
        assert_eq!(a.edge_key(), b.edge_key());
        assert_ne!(a.edge_key(), c.edge_key());
    }

    #[test]
    fn test_iso_millis_renders_utc() {
        assert_eq!(iso_millis(0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_elapsed_by_is_strict() {
        let w = TimeWindow::new(0, 100, 0);
        assert!(!w.elapsed_by(100));
        assert!(w.elapsed_by(101));
    }
}
