//! SQLite repository backend
//!
//! Document-store-style layout over an embedded SQLite database:
//! fragments keyed by `(stream_id, id)`, member sets as rows of a composite
//! primary key table (`INSERT OR IGNORE` gives add-to-set semantics), a
//! unique-indexed relation log, and a generic metadata table.
//!
//! Batched index writes (`apply`) run inside one SQLite transaction, so a
//! split's multi-document write is atomic here. The connection lives behind
//! a `std::sync::Mutex` because SQLite connections are not `Sync`; no await
//! points occur while the guard is held.

use crate::model::{Fragment, MemberRecord, Relation, RelationType, TimeWindow};
use crate::repository::{
    FragmentPatch, IndexMutation, RepoResult, Repository, RepositoryError,
};
use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Embedded SQLite backend
pub struct SqliteRepository {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteRepository {
    /// Create or open the index database at `path`
    pub fn open(path: &Path) -> RepoResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // Configure for performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = 10000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                timestamp INTEGER
            );
            CREATE TABLE IF NOT EXISTS fragments (
                stream_id TEXT NOT NULL,
                id TEXT NOT NULL,
                start INTEGER,
                span INTEGER,
                page INTEGER,
                count INTEGER NOT NULL DEFAULT 0,
                immutable INTEGER NOT NULL DEFAULT 0,
                root INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (stream_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_fragments_window
                ON fragments(stream_id, start DESC, span ASC, page DESC);
            CREATE TABLE IF NOT EXISTS fragment_members (
                stream_id TEXT NOT NULL,
                fragment_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                PRIMARY KEY (stream_id, fragment_id, member_id)
            );
            CREATE TABLE IF NOT EXISTS relations (
                stream_id TEXT NOT NULL,
                from_id TEXT NOT NULL,
                bucket TEXT NOT NULL,
                relation_type TEXT NOT NULL,
                value TEXT NOT NULL DEFAULT '',
                path TEXT NOT NULL DEFAULT '',
                UNIQUE (stream_id, from_id, bucket, relation_type, value, path)
            );
            CREATE TABLE IF NOT EXISTS meta (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> RepoResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::Lock(e.to_string()))
    }

    /// Snapshot of all fragments of a stream (diagnostics and tests)
    pub fn stream_fragments(&self, stream_id: &str) -> RepoResult<Vec<Fragment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, start, span, page, count, immutable, root FROM fragments
             WHERE stream_id = ?1 ORDER BY id",
        )?;
        let rows: Vec<Fragment> = stmt
            .query_map(params![stream_id], |row| row_to_fragment(stream_id, row))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        rows.into_iter()
            .map(|f| {
                let members = load_members(&conn, stream_id, &f.id)?;
                Ok(f.members(members))
            })
            .collect()
    }

    /// Snapshot of all relations of a stream (diagnostics and tests)
    pub fn stream_relations(&self, stream_id: &str) -> RepoResult<Vec<Relation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT from_id, bucket, relation_type, value, path FROM relations
             WHERE stream_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![stream_id], |row| {
                let type_name: String = row.get(2)?;
                let value: String = row.get(3)?;
                let path: String = row.get(4)?;
                Ok(Relation {
                    stream_id: stream_id.to_string(),
                    from: row.get(0)?,
                    bucket: row.get(1)?,
                    relation_type: relation_type_from_name(&type_name),
                    value: unpack_opt(value),
                    path: unpack_opt(path),
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}

fn row_to_fragment(stream_id: &str, row: &rusqlite::Row<'_>) -> rusqlite::Result<Fragment> {
    let start: Option<i64> = row.get(1)?;
    let span: Option<i64> = row.get(2)?;
    let page: Option<u32> = row.get(3)?;
    let window = match (start, span, page) {
        (Some(start), Some(span), Some(page)) => Some(TimeWindow::new(start, span, page)),
        _ => None,
    };
    Ok(Fragment {
        id: row.get(0)?,
        stream_id: stream_id.to_string(),
        window,
        members: Vec::new(),
        count: row.get::<_, i64>(4)? as usize,
        immutable: row.get(5)?,
        root: row.get(6)?,
    })
}

fn load_members(conn: &Connection, stream_id: &str, fragment_id: &str) -> RepoResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT member_id FROM fragment_members
         WHERE stream_id = ?1 AND fragment_id = ?2 ORDER BY rowid",
    )?;
    let members = stmt
        .query_map(params![stream_id, fragment_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(members)
}

fn relation_type_name(relation_type: RelationType) -> &'static str {
    match relation_type {
        RelationType::GreaterThanOrEqualTo => "gte",
        RelationType::LessThan => "lt",
        RelationType::Relation => "relation",
    }
}

fn relation_type_from_name(name: &str) -> RelationType {
    match name {
        "gte" => RelationType::GreaterThanOrEqualTo,
        "lt" => RelationType::LessThan,
        _ => RelationType::Relation,
    }
}

// Optional relation fields are stored as '' so the unique edge index
// collapses duplicates (SQLite treats NULLs as distinct in unique indexes).
fn pack_opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn unpack_opt(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn fragment_exists(conn: &Connection, stream_id: &str, fragment_id: &str) -> RepoResult<bool> {
    let mut stmt = conn
        .prepare_cached("SELECT 1 FROM fragments WHERE stream_id = ?1 AND id = ?2")?;
    Ok(stmt.exists(params![stream_id, fragment_id])?)
}

fn create_fragment_tx(conn: &Connection, fragment: &Fragment) -> RepoResult<()> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO fragments (stream_id, id, start, span, page, count, immutable, root)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            fragment.stream_id,
            fragment.id,
            fragment.window.map(|w| w.start),
            fragment.window.map(|w| w.span),
            fragment.window.map(|w| w.page),
            fragment.count as i64,
            fragment.immutable,
            fragment.root,
        ],
    )?;
    if inserted > 0 {
        for member in &fragment.members {
            conn.execute(
                "INSERT OR IGNORE INTO fragment_members (stream_id, fragment_id, member_id)
                 VALUES (?1, ?2, ?3)",
                params![fragment.stream_id, fragment.id, member],
            )?;
        }
    }
    Ok(())
}

fn patch_fragment_tx(
    conn: &Connection,
    stream_id: &str,
    fragment_id: &str,
    patch: &FragmentPatch,
) -> RepoResult<()> {
    if !fragment_exists(conn, stream_id, fragment_id)? {
        return Err(RepositoryError::UnknownFragment(fragment_id.to_string()));
    }
    if let Some(members) = &patch.members {
        conn.execute(
            "DELETE FROM fragment_members WHERE stream_id = ?1 AND fragment_id = ?2",
            params![stream_id, fragment_id],
        )?;
        for member in members {
            conn.execute(
                "INSERT OR IGNORE INTO fragment_members (stream_id, fragment_id, member_id)
                 VALUES (?1, ?2, ?3)",
                params![stream_id, fragment_id, member],
            )?;
        }
        conn.execute(
            "UPDATE fragments SET count = ?3 WHERE stream_id = ?1 AND id = ?2",
            params![stream_id, fragment_id, members.len() as i64],
        )?;
    }
    if let Some(immutable) = patch.immutable {
        conn.execute(
            "UPDATE fragments SET immutable = ?3 WHERE stream_id = ?1 AND id = ?2",
            params![stream_id, fragment_id, immutable],
        )?;
    }
    if let Some(root) = patch.root {
        conn.execute(
            "UPDATE fragments SET root = ?3 WHERE stream_id = ?1 AND id = ?2",
            params![stream_id, fragment_id, root],
        )?;
    }
    Ok(())
}

fn append_relation_tx(conn: &Connection, relation: &Relation) -> RepoResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO relations (stream_id, from_id, bucket, relation_type, value, path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            relation.stream_id,
            relation.from,
            relation.bucket,
            relation_type_name(relation.relation_type),
            pack_opt(&relation.value),
            pack_opt(&relation.path),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn find_candidate(&self, stream_id: &str, timestamp: i64) -> RepoResult<Option<Fragment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, start, span, page, count, immutable, root FROM fragments
             WHERE stream_id = ?1 AND start IS NOT NULL AND start <= ?2
             ORDER BY start DESC, span ASC, page DESC
             LIMIT 1",
        )?;
        let hit = stmt
            .query_map(params![stream_id, timestamp], |row| {
                row_to_fragment(stream_id, row)
            })?
            .next()
            .transpose()?;
        drop(stmt);

        match hit {
            Some(fragment) => {
                let members = load_members(&conn, stream_id, &fragment.id)?;
                Ok(Some(fragment.members(members)))
            }
            None => Ok(None),
        }
    }

    async fn insert_member(
        &self,
        stream_id: &str,
        fragment_id: &str,
        member_id: &str,
    ) -> RepoResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !fragment_exists(&tx, stream_id, fragment_id)? {
            return Err(RepositoryError::UnknownFragment(fragment_id.to_string()));
        }
        let added = tx.execute(
            "INSERT OR IGNORE INTO fragment_members (stream_id, fragment_id, member_id)
             VALUES (?1, ?2, ?3)",
            params![stream_id, fragment_id, member_id],
        )?;
        if added > 0 {
            tx.execute(
                "UPDATE fragments SET count = count + 1 WHERE stream_id = ?1 AND id = ?2",
                params![stream_id, fragment_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn create_fragment(&self, fragment: &Fragment) -> RepoResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        create_fragment_tx(&tx, fragment)?;
        tx.commit()?;
        Ok(())
    }

    async fn create_fragments(&self, fragments: &[Fragment]) -> RepoResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for fragment in fragments {
            create_fragment_tx(&tx, fragment)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn update_fragment(
        &self,
        stream_id: &str,
        fragment_id: &str,
        patch: FragmentPatch,
    ) -> RepoResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        patch_fragment_tx(&tx, stream_id, fragment_id, &patch)?;
        tx.commit()?;
        Ok(())
    }

    async fn upsert_bucket(
        &self,
        stream_id: &str,
        bucket_id: &str,
        patch: FragmentPatch,
    ) -> RepoResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        create_fragment_tx(&tx, &Fragment::bucket(stream_id, bucket_id))?;
        patch_fragment_tx(&tx, stream_id, bucket_id, &patch)?;
        tx.commit()?;
        Ok(())
    }

    async fn add_member_to_bucket(
        &self,
        stream_id: &str,
        bucket_id: &str,
        member_id: &str,
    ) -> RepoResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        create_fragment_tx(&tx, &Fragment::bucket(stream_id, bucket_id))?;
        let added = tx.execute(
            "INSERT OR IGNORE INTO fragment_members (stream_id, fragment_id, member_id)
             VALUES (?1, ?2, ?3)",
            params![stream_id, bucket_id, member_id],
        )?;
        if added > 0 {
            tx.execute(
                "UPDATE fragments SET count = count + 1 WHERE stream_id = ?1 AND id = ?2",
                params![stream_id, bucket_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn members_by_timestamp(&self, member_ids: &[String]) -> RepoResult<Vec<(String, i64)>> {
        if member_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; member_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, timestamp FROM records
             WHERE timestamp IS NOT NULL AND id IN ({placeholders})
             ORDER BY timestamp ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(member_ids.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    async fn append_relations(&self, relations: &[Relation]) -> RepoResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for relation in relations {
            append_relation_tx(&tx, relation)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn remove_relations(
        &self,
        relation: &Relation,
        match_path: Option<&str>,
        match_value: Option<&str>,
    ) -> RepoResult<u64> {
        let conn = self.lock()?;
        let mut sql = String::from(
            "DELETE FROM relations
             WHERE stream_id = ?1 AND from_id = ?2 AND bucket = ?3 AND relation_type = ?4",
        );
        let mut args: Vec<String> = vec![
            relation.stream_id.clone(),
            relation.from.clone(),
            relation.bucket.clone(),
            relation_type_name(relation.relation_type).to_string(),
        ];
        if let Some(path) = match_path {
            args.push(path.to_string());
            sql.push_str(&format!(" AND path = ?{}", args.len()));
        }
        if let Some(value) = match_value {
            args.push(value.to_string());
            sql.push_str(&format!(" AND value = ?{}", args.len()));
        }
        let removed = conn.execute(&sql, params_from_iter(args.iter()))?;
        Ok(removed as u64)
    }

    async fn count_fragments(&self, stream_id: &str) -> RepoResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fragments WHERE stream_id = ?1 AND start IS NOT NULL",
            params![stream_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn record_exists(&self, member_id: &str) -> RepoResult<bool> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT 1 FROM records WHERE id = ?1")?;
        Ok(stmt.exists(params![member_id])?)
    }

    async fn put_record(&self, record: &MemberRecord) -> RepoResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO records (id, payload, timestamp) VALUES (?1, ?2, ?3)",
            params![record.id, record.payload, record.timestamp],
        )?;
        Ok(())
    }

    async fn sweep_immutable(&self, stream_id: &str, t_max: i64) -> RepoResult<u64> {
        let conn = self.lock()?;
        let flipped = conn.execute(
            "UPDATE fragments SET immutable = 1
             WHERE stream_id = ?1 AND immutable = 0
               AND start IS NOT NULL AND start <= ?2 AND start + span < ?2",
            params![stream_id, t_max],
        )?;
        Ok(flipped as u64)
    }

    async fn apply(&self, mutations: Vec<IndexMutation>) -> RepoResult<()> {
        // The whole batch commits or rolls back as one transaction.
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for mutation in &mutations {
            match mutation {
                IndexMutation::CreateFragment(fragment) => create_fragment_tx(&tx, fragment)?,
                IndexMutation::PatchFragment {
                    stream_id,
                    fragment_id,
                    patch,
                } => patch_fragment_tx(&tx, stream_id, fragment_id, patch)?,
                IndexMutation::AppendRelation(relation) => append_relation_tx(&tx, relation)?,
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn put_meta(&self, kind: &str, id: &str, value: &str) -> RepoResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (kind, id, value) VALUES (?1, ?2, ?3)",
            params![kind, id, value],
        )?;
        Ok(())
    }

    async fn get_meta(&self, kind: &str, id: &str) -> RepoResult<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT value FROM meta WHERE kind = ?1 AND id = ?2")?;
        let value = stmt
            .query_map(params![kind, id], |row| row.get(0))?
            .next()
            .transpose()?;
        Ok(value)
    }

    async fn list_meta(&self, kind: &str) -> RepoResult<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT id, value FROM meta WHERE kind = ?1 ORDER BY id")?;
        let entries = stmt
            .query_map(params![kind], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_repo(dir: &tempfile::TempDir) -> SqliteRepository {
        SqliteRepository::open(&dir.path().join("index.db")).unwrap()
    }

    #[tokio::test]
    async fn test_candidate_ordering() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir);

        // parent window, its first child, and a paginated sibling of the child
        repo.create_fragments(&[
            Fragment::temporal("s", TimeWindow::new(0, 400, 0)),
            Fragment::temporal("s", TimeWindow::new(0, 100, 0)),
            Fragment::temporal("s", TimeWindow::new(0, 100, 1)),
            Fragment::temporal("s", TimeWindow::new(100, 100, 0)),
        ])
        .await
        .unwrap();

        let hit = repo.find_candidate("s", 50).await.unwrap().unwrap();
        let window = hit.window.unwrap();
        assert_eq!((window.start, window.span, window.page), (0, 100, 1));

        let hit = repo.find_candidate("s", 150).await.unwrap().unwrap();
        assert_eq!(hit.window.unwrap().start, 100);

        assert!(repo.find_candidate("s", -1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_member_set_semantics() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir);
        let fragment = Fragment::temporal("s", TimeWindow::new(0, 100, 0));
        repo.create_fragment(&fragment).await.unwrap();

        repo.insert_member("s", &fragment.id, "m1").await.unwrap();
        repo.insert_member("s", &fragment.id, "m1").await.unwrap();
        repo.insert_member("s", &fragment.id, "m2").await.unwrap();

        let stored = &repo.stream_fragments("s").unwrap()[0];
        assert_eq!(stored.members, vec!["m1", "m2"]);
        assert_eq!(stored.count, 2);

        let missing = repo.insert_member("s", "nope", "m1").await;
        assert!(matches!(missing, Err(RepositoryError::UnknownFragment(_))));
    }

    #[tokio::test]
    async fn test_update_fragment_partial_patch() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir);
        let fragment = Fragment::temporal("s", TimeWindow::new(0, 100, 0))
            .members(vec!["m1".into(), "m2".into()]);
        repo.create_fragment(&fragment).await.unwrap();

        // flag-only patch leaves membership alone
        repo.update_fragment("s", &fragment.id, FragmentPatch::new().immutable(true))
            .await
            .unwrap();
        let stored = &repo.stream_fragments("s").unwrap()[0];
        assert!(stored.immutable);
        assert_eq!(stored.members, vec!["m1", "m2"]);

        // member replacement keeps count in sync, other fields untouched
        repo.update_fragment(
            "s",
            &fragment.id,
            FragmentPatch::new().members(vec!["m3".into()]),
        )
        .await
        .unwrap();
        let stored = &repo.stream_fragments("s").unwrap()[0];
        assert_eq!(stored.members, vec!["m3"]);
        assert_eq!(stored.count, 1);
        assert!(stored.immutable);

        let missing = repo
            .update_fragment("s", "nope", FragmentPatch::new().root(true))
            .await;
        assert!(matches!(missing, Err(RepositoryError::UnknownFragment(_))));
    }

    #[tokio::test]
    async fn test_pagination_relations_collapse_without_value() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir);

        // untyped continuation edges have no value/path and must still dedup
        let rel = Relation::new("s", "f", "b", RelationType::Relation);
        repo.append_relations(&[rel.clone()]).await.unwrap();
        repo.append_relations(&[rel]).await.unwrap();
        assert_eq!(repo.stream_relations("s").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_batch_in_one_transaction() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir);
        let parent =
            Fragment::temporal("s", TimeWindow::new(0, 400, 0)).members(vec!["m".into()]);
        repo.create_fragment(&parent).await.unwrap();

        let child = Fragment::temporal("s", TimeWindow::new(0, 100, 0)).members(vec!["m".into()]);
        repo.apply(vec![
            IndexMutation::AppendRelation(
                Relation::new("s", parent.id.clone(), child.id.clone(), RelationType::LessThan)
                    .value("v"),
            ),
            IndexMutation::CreateFragment(child.clone()),
            IndexMutation::PatchFragment {
                stream_id: "s".into(),
                fragment_id: parent.id.clone(),
                patch: FragmentPatch::new().clear_members(),
            },
        ])
        .await
        .unwrap();

        let fragments = repo.stream_fragments("s").unwrap();
        let parent_now = fragments.iter().find(|f| f.id == parent.id).unwrap();
        let child_now = fragments.iter().find(|f| f.id == child.id).unwrap();
        assert_eq!(parent_now.count, 0);
        assert_eq!(child_now.members, vec!["m"]);
        assert_eq!(repo.stream_relations("s").unwrap().len(), 1);

        // a batch with a bad patch rolls back entirely
        let err = repo
            .apply(vec![
                IndexMutation::AppendRelation(Relation::new(
                    "s",
                    "x",
                    "y",
                    RelationType::Relation,
                )),
                IndexMutation::PatchFragment {
                    stream_id: "s".into(),
                    fragment_id: "missing".into(),
                    patch: FragmentPatch::new().immutable(true),
                },
            ])
            .await;
        assert!(err.is_err());
        assert_eq!(repo.stream_relations("s").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_records_and_split_ordering() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir);

        repo.put_record(&MemberRecord::new("b", "pb").timestamp(20))
            .await
            .unwrap();
        repo.put_record(&MemberRecord::new("a", "pa").timestamp(10))
            .await
            .unwrap();
        repo.put_record(&MemberRecord::new("a", "other").timestamp(99))
            .await
            .unwrap();

        assert!(repo.record_exists("a").await.unwrap());
        assert!(!repo.record_exists("c").await.unwrap());

        let ids: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let rows = repo.members_by_timestamp(&ids).await.unwrap();
        assert_eq!(rows, vec![("a".to_string(), 10), ("b".to_string(), 20)]);
    }

    #[tokio::test]
    async fn test_sweep_immutable() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir);
        repo.create_fragments(&[
            Fragment::temporal("s", TimeWindow::new(0, 100, 0)),
            Fragment::temporal("s", TimeWindow::new(100, 100, 0)),
        ])
        .await
        .unwrap();

        assert_eq!(repo.sweep_immutable("s", 100).await.unwrap(), 0);
        assert_eq!(repo.sweep_immutable("s", 150).await.unwrap(), 1);
        assert_eq!(repo.sweep_immutable("s", 150).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();

        {
            let repo = open_repo(&dir);
            repo.create_fragment(
                &Fragment::temporal("s", TimeWindow::new(0, 100, 0)).members(vec!["m".into()]),
            )
            .await
            .unwrap();
            repo.put_meta("stream", "s", "path").await.unwrap();
        }

        {
            let repo = open_repo(&dir);
            let fragments = repo.stream_fragments("s").unwrap();
            assert_eq!(fragments.len(), 1);
            assert_eq!(fragments[0].members, vec!["m"]);
            assert_eq!(
                repo.get_meta("stream", "s").await.unwrap().as_deref(),
                Some("path")
            );
        }
    }

    #[tokio::test]
    async fn test_bucket_upsert_and_member_add() {
        let dir = tempdir().unwrap();
        let repo = open_repo(&dir);

        repo.add_member_to_bucket("s", "urn:b", "m1").await.unwrap();
        repo.add_member_to_bucket("s", "urn:b", "m1").await.unwrap();
        repo.upsert_bucket("s", "urn:b", FragmentPatch::new().immutable(true))
            .await
            .unwrap();

        let stored = &repo.stream_fragments("s").unwrap()[0];
        assert_eq!(stored.count, 1);
        assert!(stored.immutable);
        assert!(stored.window.is_none());
        // bucket fragments are invisible to the temporal candidate lookup
        assert!(repo.find_candidate("s", 0).await.unwrap().is_none());
    }
}
