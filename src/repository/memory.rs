//! In-memory repository backend
//!
//! Hash maps behind a single async `RwLock`. `apply` holds the write lock
//! for the whole mutation list, so a split's multi-document write is atomic.
//! Used as the reference backend in tests and scenarios.

use crate::model::{Fragment, MemberRecord, Relation};
use crate::repository::{
    FragmentPatch, IndexMutation, RepoResult, Repository, RepositoryError,
};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    /// Member records by id
    records: HashMap<String, MemberRecord>,
    /// Fragments by (stream_id, fragment_id)
    fragments: HashMap<(String, String), Fragment>,
    /// Append-only edge log, dedup by edge key
    relations: Vec<Relation>,
    /// Metadata by (kind, id)
    meta: HashMap<(String, String), String>,
}

impl State {
    fn create_fragment(&mut self, fragment: &Fragment) {
        self.fragments
            .entry((fragment.stream_id.clone(), fragment.id.clone()))
            .or_insert_with(|| fragment.clone());
    }

    fn patch_fragment(
        &mut self,
        stream_id: &str,
        fragment_id: &str,
        patch: &FragmentPatch,
    ) -> RepoResult<()> {
        let fragment = self
            .fragments
            .get_mut(&(stream_id.to_string(), fragment_id.to_string()))
            .ok_or_else(|| RepositoryError::UnknownFragment(fragment_id.to_string()))?;
        apply_patch(fragment, patch);
        Ok(())
    }

    fn append_relation(&mut self, relation: &Relation) {
        let exists = self
            .relations
            .iter()
            .any(|r| r.edge_key() == relation.edge_key());
        if !exists {
            self.relations.push(relation.clone());
        }
    }
}

fn apply_patch(fragment: &mut Fragment, patch: &FragmentPatch) {
    if let Some(members) = &patch.members {
        fragment.members = members.clone();
        fragment.count = members.len();
    }
    if let Some(immutable) = patch.immutable {
        fragment.immutable = immutable;
    }
    if let Some(root) = patch.root {
        fragment.root = root;
    }
}

/// In-memory reference backend
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all fragments of a stream (diagnostics and tests)
    pub async fn stream_fragments(&self, stream_id: &str) -> Vec<Fragment> {
        let state = self.state.read().await;
        let mut fragments: Vec<Fragment> = state
            .fragments
            .values()
            .filter(|f| f.stream_id == stream_id)
            .cloned()
            .collect();
        fragments.sort_by(|a, b| a.id.cmp(&b.id));
        fragments
    }

    /// Snapshot of all relations of a stream (diagnostics and tests)
    pub async fn stream_relations(&self, stream_id: &str) -> Vec<Relation> {
        let state = self.state.read().await;
        state
            .relations
            .iter()
            .filter(|r| r.stream_id == stream_id)
            .cloned()
            .collect()
    }

    /// Number of stored member records (diagnostics and tests)
    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_candidate(&self, stream_id: &str, timestamp: i64) -> RepoResult<Option<Fragment>> {
        let state = self.state.read().await;
        let best = state
            .fragments
            .values()
            .filter(|f| f.stream_id == stream_id)
            .filter_map(|f| f.window.map(|w| (w, f)))
            .filter(|(w, _)| w.start <= timestamp)
            .max_by_key(|(w, _)| (w.start, Reverse(w.span), w.page));
        Ok(best.map(|(_, f)| f.clone()))
    }

    async fn insert_member(
        &self,
        stream_id: &str,
        fragment_id: &str,
        member_id: &str,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let fragment = state
            .fragments
            .get_mut(&(stream_id.to_string(), fragment_id.to_string()))
            .ok_or_else(|| RepositoryError::UnknownFragment(fragment_id.to_string()))?;
        if !fragment.members.iter().any(|m| m == member_id) {
            fragment.members.push(member_id.to_string());
            fragment.count += 1;
        }
        Ok(())
    }

    async fn create_fragment(&self, fragment: &Fragment) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.create_fragment(fragment);
        Ok(())
    }

    async fn create_fragments(&self, fragments: &[Fragment]) -> RepoResult<()> {
        let mut state = self.state.write().await;
        for fragment in fragments {
            state.create_fragment(fragment);
        }
        Ok(())
    }

    async fn update_fragment(
        &self,
        stream_id: &str,
        fragment_id: &str,
        patch: FragmentPatch,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.patch_fragment(stream_id, fragment_id, &patch)
    }

    async fn upsert_bucket(
        &self,
        stream_id: &str,
        bucket_id: &str,
        patch: FragmentPatch,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let fragment = state
            .fragments
            .entry((stream_id.to_string(), bucket_id.to_string()))
            .or_insert_with(|| Fragment::bucket(stream_id, bucket_id));
        apply_patch(fragment, &patch);
        Ok(())
    }

    async fn add_member_to_bucket(
        &self,
        stream_id: &str,
        bucket_id: &str,
        member_id: &str,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let fragment = state
            .fragments
            .entry((stream_id.to_string(), bucket_id.to_string()))
            .or_insert_with(|| Fragment::bucket(stream_id, bucket_id));
        if !fragment.members.iter().any(|m| m == member_id) {
            fragment.members.push(member_id.to_string());
            fragment.count += 1;
        }
        Ok(())
    }

    async fn members_by_timestamp(&self, member_ids: &[String]) -> RepoResult<Vec<(String, i64)>> {
        let state = self.state.read().await;
        let mut rows: Vec<(String, i64)> = member_ids
            .iter()
            .filter_map(|id| {
                state
                    .records
                    .get(id)
                    .and_then(|r| r.timestamp)
                    .map(|ts| (id.clone(), ts))
            })
            .collect();
        rows.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        Ok(rows)
    }

    async fn append_relations(&self, relations: &[Relation]) -> RepoResult<()> {
        let mut state = self.state.write().await;
        for relation in relations {
            state.append_relation(relation);
        }
        Ok(())
    }

    async fn remove_relations(
        &self,
        relation: &Relation,
        match_path: Option<&str>,
        match_value: Option<&str>,
    ) -> RepoResult<u64> {
        let mut state = self.state.write().await;
        let before = state.relations.len();
        state.relations.retain(|r| {
            let hit = r.stream_id == relation.stream_id
                && r.from == relation.from
                && r.bucket == relation.bucket
                && r.relation_type == relation.relation_type
                && match_path.map_or(true, |p| r.path.as_deref() == Some(p))
                && match_value.map_or(true, |v| r.value.as_deref() == Some(v));
            !hit
        });
        Ok((before - state.relations.len()) as u64)
    }

    async fn count_fragments(&self, stream_id: &str) -> RepoResult<u64> {
        let state = self.state.read().await;
        let count = state
            .fragments
            .values()
            .filter(|f| f.stream_id == stream_id && f.window.is_some())
            .count();
        Ok(count as u64)
    }

    async fn record_exists(&self, member_id: &str) -> RepoResult<bool> {
        let state = self.state.read().await;
        Ok(state.records.contains_key(member_id))
    }

    async fn put_record(&self, record: &MemberRecord) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state
            .records
            .entry(record.id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn sweep_immutable(&self, stream_id: &str, t_max: i64) -> RepoResult<u64> {
        let mut state = self.state.write().await;
        let mut flipped = 0;
        for fragment in state.fragments.values_mut() {
            if fragment.stream_id != stream_id || fragment.immutable {
                continue;
            }
            if let Some(window) = fragment.window {
                if window.start <= t_max && window.elapsed_by(t_max) {
                    fragment.immutable = true;
                    flipped += 1;
                }
            }
        }
        Ok(flipped)
    }

    async fn apply(&self, mutations: Vec<IndexMutation>) -> RepoResult<()> {
        // One write-lock scope for the whole batch: atomic as seen by readers.
        let mut state = self.state.write().await;
        for mutation in &mutations {
            match mutation {
                IndexMutation::CreateFragment(fragment) => state.create_fragment(fragment),
                IndexMutation::PatchFragment {
                    stream_id,
                    fragment_id,
                    patch,
                } => state.patch_fragment(stream_id, fragment_id, patch)?,
                IndexMutation::AppendRelation(relation) => state.append_relation(relation),
            }
        }
        Ok(())
    }

    async fn put_meta(&self, kind: &str, id: &str, value: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state
            .meta
            .insert((kind.to_string(), id.to_string()), value.to_string());
        Ok(())
    }

    async fn get_meta(&self, kind: &str, id: &str) -> RepoResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state.meta.get(&(kind.to_string(), id.to_string())).cloned())
    }

    async fn list_meta(&self, kind: &str) -> RepoResult<Vec<(String, String)>> {
        let state = self.state.read().await;
        let mut entries: Vec<(String, String)> = state
            .meta
            .iter()
            .filter(|((k, _), _)| k == kind)
            .map(|((_, id), value)| (id.clone(), value.clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }
}
