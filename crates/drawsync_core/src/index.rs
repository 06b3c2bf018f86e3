use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use tracing::{info, warn};

use crate::content_store::ContentStore;
use crate::metadata::{DiagramRecord, MetadataStore, unix_timestamp};

/// Bumped whenever the index schema or tokenizer changes; a mismatch forces a rebuild.
pub const INDEX_FORMAT_VERSION: i64 = 1;

const INDEX_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS index_documents (
    doc_id INTEGER PRIMARY KEY,
    identity TEXT NOT NULL UNIQUE,
    space_key TEXT NOT NULL,
    page_id TEXT NOT NULL,
    diagram_id TEXT NOT NULL,
    local_revision INTEGER NOT NULL,
    indexed_at_unix INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_index_documents_space ON index_documents(space_key);

CREATE VIRTUAL TABLE IF NOT EXISTS diagram_fts USING fts5(
    diagram_name,
    page_title,
    extracted_text,
    tokenize = 'porter unicode61'
);

CREATE TABLE IF NOT EXISTS index_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const DROP_INDEX_SQL: &str = r#"
DROP TABLE IF EXISTS diagram_fts;
DROP TABLE IF EXISTS index_documents;
DROP TABLE IF EXISTS index_state;
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Incremental,
    Rebuild,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Convergence {
    pub converged: bool,
    /// Active in the metadata store but absent from the index.
    pub missing: Vec<String>,
    /// Present in the index but not active in the metadata store.
    pub stale: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSyncReport {
    pub index_path: String,
    pub mode: IndexMode,
    /// Set when an incremental request was upgraded because of a format change.
    pub format_rebuild: bool,
    pub upserted: usize,
    pub removed: usize,
    pub watermark_before: i64,
    pub watermark_after: i64,
    pub documents: usize,
    pub convergence: Convergence,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub watermark: i64,
    pub format_version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    Name,
    Title,
    Content,
}

impl SearchField {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "name" | "diagram_name" => Ok(Self::Name),
            "title" | "page_title" => Ok(Self::Title),
            "content" | "text" | "extracted_text" => Ok(Self::Content),
            other => bail!("unknown search field `{other}` (expected name, title or content)"),
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::Name => "diagram_name",
            Self::Title => "page_title",
            Self::Content => "extracted_text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub field: Option<SearchField>,
    pub space: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub identity: String,
    pub space_key: String,
    pub page_id: String,
    pub diagram_id: String,
    pub diagram_name: String,
    pub page_title: String,
    pub snippet: String,
    pub rank: f64,
}

/// Full-text index over active diagram records, kept in its own database.
pub struct SearchIndex {
    connection: Connection,
    index_path: PathBuf,
}

impl SearchIndex {
    pub fn open(index_path: &Path) -> Result<Self> {
        if let Some(parent) = index_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create index parent directory {}", parent.display())
            })?;
        }
        let connection = open_connection(index_path)?;
        connection
            .execute_batch(INDEX_SCHEMA_SQL)
            .context("failed to initialize index schema")?;
        Ok(Self {
            connection,
            index_path: index_path.to_path_buf(),
        })
    }

    /// `None` when no index has been built yet.
    pub fn open_existing(index_path: &Path) -> Result<Option<Self>> {
        if !index_path.exists() {
            return Ok(None);
        }
        let connection = open_connection(index_path)?;
        if !table_exists(&connection, "index_documents")? || !table_exists(&connection, "diagram_fts")?
        {
            return Ok(None);
        }
        Ok(Some(Self {
            connection,
            index_path: index_path.to_path_buf(),
        }))
    }

    pub fn watermark(&self) -> Result<i64> {
        Ok(get_state(&self.connection, "watermark")?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    pub fn format_version(&self) -> Result<Option<i64>> {
        Ok(get_state(&self.connection, "format_version")?.and_then(|value| value.parse().ok()))
    }

    pub fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            documents: count_documents(&self.connection)?,
            watermark: self.watermark()?,
            format_version: self.format_version()?,
        })
    }

    pub fn sync(&self, store: &MetadataStore, mode: IndexMode) -> Result<IndexSyncReport> {
        match mode {
            IndexMode::Incremental => self.sync_incremental(store),
            IndexMode::Rebuild => self.rebuild(store, false),
        }
    }

    /// Applies every record changed since the stored watermark.
    pub fn sync_incremental(&self, store: &MetadataStore) -> Result<IndexSyncReport> {
        let stored_format = self.format_version()?;
        let never_built = stored_format.is_none() && count_documents(&self.connection)? == 0;
        if stored_format != Some(INDEX_FORMAT_VERSION) && !never_built {
            warn!(
                stored = ?stored_format,
                current = INDEX_FORMAT_VERSION,
                "index format changed; rebuilding"
            );
            return self.rebuild(store, true);
        }

        let watermark_before = self.watermark()?;
        let snapshot = store
            .snapshot_changed_since(watermark_before)
            .context("failed to read changed records from metadata store")?;

        let tx = self.begin_write()?;
        let mut upserted = 0usize;
        let mut removed = 0usize;
        for record in &snapshot.records {
            if record.deleted {
                if remove_document(&tx, &record.key().identity())? {
                    removed += 1;
                }
            } else {
                upsert_document(&tx, record)?;
                upserted += 1;
            }
        }
        let current = get_state(&tx, "watermark")?
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        let watermark_after = current.max(snapshot.change_seq);
        set_state(&tx, "watermark", &watermark_after.to_string())?;
        set_state(&tx, "format_version", &INDEX_FORMAT_VERSION.to_string())?;
        tx.commit().context("failed to commit incremental index sync")?;

        self.finish_report(
            store,
            IndexMode::Incremental,
            false,
            upserted,
            removed,
            watermark_before,
            watermark_after,
        )
    }

    /// Replaces the whole index with the active records of one metadata snapshot.
    pub fn rebuild(&self, store: &MetadataStore, format_rebuild: bool) -> Result<IndexSyncReport> {
        let watermark_before = self.watermark().unwrap_or(0);
        let removed = count_documents(&self.connection).unwrap_or(0);
        let snapshot = store
            .snapshot_active()
            .context("failed to snapshot metadata store for rebuild")?;

        let tx = self.begin_write()?;
        tx.execute_batch(DROP_INDEX_SQL)
            .context("failed to drop previous index generation")?;
        tx.execute_batch(INDEX_SCHEMA_SQL)
            .context("failed to create index generation")?;
        for record in &snapshot.records {
            upsert_document(&tx, record)?;
        }
        set_state(&tx, "watermark", &snapshot.change_seq.to_string())?;
        set_state(&tx, "format_version", &INDEX_FORMAT_VERSION.to_string())?;
        tx.commit().context("failed to commit index rebuild")?;

        self.finish_report(
            store,
            IndexMode::Rebuild,
            format_rebuild,
            snapshot.records.len(),
            removed,
            watermark_before,
            snapshot.change_seq,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_report(
        &self,
        store: &MetadataStore,
        mode: IndexMode,
        format_rebuild: bool,
        upserted: usize,
        removed: usize,
        watermark_before: i64,
        watermark_after: i64,
    ) -> Result<IndexSyncReport> {
        let convergence = self.verify_convergence(store)?;
        if !convergence.converged {
            warn!(
                missing = convergence.missing.len(),
                stale = convergence.stale.len(),
                "index does not match metadata store"
            );
        }
        let report = IndexSyncReport {
            index_path: self.index_path.to_string_lossy().replace('\\', "/"),
            mode,
            format_rebuild,
            upserted,
            removed,
            watermark_before,
            watermark_after,
            documents: count_documents(&self.connection)?,
            convergence,
        };
        info!(
            mode = ?report.mode,
            upserted = report.upserted,
            removed = report.removed,
            watermark = report.watermark_after,
            "index synchronized"
        );
        Ok(report)
    }

    /// Compares indexed identities with the store's active identities.
    pub fn verify_convergence(&self, store: &MetadataStore) -> Result<Convergence> {
        let indexed = self.indexed_identities()?;
        let active: BTreeSet<String> = store
            .list_all_active(None)?
            .iter()
            .map(|record| record.key().identity())
            .collect();
        let missing: Vec<String> = active.difference(&indexed).cloned().collect();
        let stale: Vec<String> = indexed.difference(&active).cloned().collect();
        Ok(Convergence {
            converged: missing.is_empty() && stale.is_empty(),
            missing,
            stale,
        })
    }

    pub fn indexed_identities(&self) -> Result<BTreeSet<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT identity FROM index_documents")
            .context("failed to prepare identity query")?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to run identity query")?;
        let mut out = BTreeSet::new();
        for row in rows {
            out.insert(row.context("failed to decode identity row")?);
        }
        Ok(out)
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let Some(expression) = build_match_expression(&query.text, query.field) else {
            return Ok(Vec::new());
        };
        let limit = i64::try_from(query.limit.max(1)).context("search limit does not fit into i64")?;
        let mut statement = self
            .connection
            .prepare(
                "SELECT d.identity, d.space_key, d.page_id, d.diagram_id,
                        diagram_fts.diagram_name, diagram_fts.page_title,
                        snippet(diagram_fts, 2, '[', ']', '...', 12),
                        diagram_fts.rank
                 FROM diagram_fts
                 JOIN index_documents d ON d.doc_id = diagram_fts.rowid
                 WHERE diagram_fts MATCH ?1
                   AND (?2 IS NULL OR d.space_key = ?2)
                 ORDER BY diagram_fts.rank
                 LIMIT ?3",
            )
            .context("failed to prepare FTS search query")?;
        let rows = statement
            .query_map(params![expression, query.space, limit], |row| {
                Ok(SearchHit {
                    identity: row.get(0)?,
                    space_key: row.get(1)?,
                    page_id: row.get(2)?,
                    diagram_id: row.get(3)?,
                    diagram_name: row.get(4)?,
                    page_title: row.get(5)?,
                    snippet: row.get(6)?,
                    rank: row.get(7)?,
                })
            })
            .context("failed to run FTS search query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode FTS search row")?);
        }
        Ok(out)
    }

    fn begin_write(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.connection, TransactionBehavior::Immediate)
            .context("failed to begin index write transaction")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub targets: Vec<String>,
    pub removed_spaces: Vec<String>,
    pub removed_records: usize,
    pub removed_content_dirs: usize,
}

/// Drops metadata rows and content of every space outside `targets`. Only a
/// full rebuild runs this, since a normal crawl never learns that a whole
/// space went away.
pub fn prune_untargeted_spaces(
    store: &MetadataStore,
    content: &ContentStore,
    targets: &[String],
) -> Result<PruneReport> {
    let removed = store.prune_spaces_not_in(targets)?;
    let mut report = PruneReport {
        targets: targets.to_vec(),
        removed_records: removed.len(),
        ..PruneReport::default()
    };
    for record in &removed {
        if content.delete_diagram(&record.space_key, &record.diagram_id)? {
            report.removed_content_dirs += 1;
        }
        if !report.removed_spaces.contains(&record.space_key) {
            report.removed_spaces.push(record.space_key.clone());
        }
    }
    info!(
        spaces = report.removed_spaces.len(),
        records = report.removed_records,
        "pruned untargeted spaces"
    );
    Ok(report)
}

/// Opens (creating if needed) the index and runs one sync against the store.
pub fn sync_index(
    index_path: &Path,
    store: &MetadataStore,
    mode: IndexMode,
) -> Result<IndexSyncReport> {
    SearchIndex::open(index_path)?.sync(store, mode)
}

/// Quoted alphanumeric terms OR'd together; the last term matches as a prefix.
fn build_match_expression(text: &str, field: Option<SearchField>) -> Option<String> {
    let terms: Vec<&str> = text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .collect();
    let last = terms.len().checked_sub(1)?;
    let prefix = field
        .map(|field| format!("{} : ", field.column()))
        .unwrap_or_default();
    let parts: Vec<String> = terms
        .iter()
        .enumerate()
        .map(|(index, term)| {
            if index == last {
                format!("{prefix}\"{term}\" *")
            } else {
                format!("{prefix}\"{term}\"")
            }
        })
        .collect();
    Some(parts.join(" OR "))
}

fn upsert_document(connection: &Connection, record: &DiagramRecord) -> Result<()> {
    let identity = record.key().identity();
    let now = unix_timestamp()?;
    let existing: Option<i64> = connection
        .query_row(
            "SELECT doc_id FROM index_documents WHERE identity = ?1",
            [&identity],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to look up index document {identity}"))?;

    let doc_id = match existing {
        Some(doc_id) => {
            connection
                .execute(
                    "UPDATE index_documents SET local_revision = ?2, indexed_at_unix = ?3
                     WHERE doc_id = ?1",
                    params![doc_id, record.local_revision, now],
                )
                .with_context(|| format!("failed to update index document {identity}"))?;
            connection
                .execute("DELETE FROM diagram_fts WHERE rowid = ?1", [doc_id])
                .with_context(|| format!("failed to clear FTS row of {identity}"))?;
            doc_id
        }
        None => {
            connection
                .execute(
                    "INSERT INTO index_documents (
                        identity, space_key, page_id, diagram_id, local_revision, indexed_at_unix
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        identity,
                        record.space_key,
                        record.page_id,
                        record.diagram_id,
                        record.local_revision,
                        now
                    ],
                )
                .with_context(|| format!("failed to insert index document {identity}"))?;
            connection.last_insert_rowid()
        }
    };

    connection
        .execute(
            "INSERT INTO diagram_fts (rowid, diagram_name, page_title, extracted_text)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                doc_id,
                record.diagram_name,
                record.page_title,
                record.extracted_text
            ],
        )
        .with_context(|| format!("failed to index {identity}"))?;
    Ok(())
}

fn remove_document(connection: &Connection, identity: &str) -> Result<bool> {
    let existing: Option<i64> = connection
        .query_row(
            "SELECT doc_id FROM index_documents WHERE identity = ?1",
            [identity],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to look up index document {identity}"))?;
    let Some(doc_id) = existing else {
        return Ok(false);
    };
    connection
        .execute("DELETE FROM diagram_fts WHERE rowid = ?1", [doc_id])
        .with_context(|| format!("failed to remove FTS row of {identity}"))?;
    connection
        .execute("DELETE FROM index_documents WHERE doc_id = ?1", [doc_id])
        .with_context(|| format!("failed to remove index document {identity}"))?;
    Ok(true)
}

fn get_state(connection: &Connection, key: &str) -> Result<Option<String>> {
    if !table_exists(connection, "index_state")? {
        return Ok(None);
    }
    connection
        .query_row(
            "SELECT value FROM index_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read index_state key {key}"))
}

fn set_state(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT INTO index_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to write index_state key {key}"))?;
    Ok(())
}

fn count_documents(connection: &Connection) -> Result<usize> {
    let count: i64 = connection
        .query_row("SELECT COUNT(*) FROM index_documents", [], |row| row.get(0))
        .context("failed to count index documents")?;
    usize::try_from(count).context("count does not fit into usize")
}

fn open_connection(index_path: &Path) -> Result<Connection> {
    let connection = Connection::open(index_path)
        .with_context(|| format!("failed to open {}", index_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tempfile::tempdir;

    use super::*;
    use crate::metadata::{DiagramKey, DiagramRecord, MetadataStore};

    fn record(space: &str, diagram: &str, name: &str, title: &str, text: &str) -> DiagramRecord {
        DiagramRecord {
            space_key: space.to_string(),
            page_id: "100".to_string(),
            diagram_id: diagram.to_string(),
            page_title: title.to_string(),
            diagram_name: name.to_string(),
            content_fingerprint: format!("{diagram}:v1"),
            local_revision: 0,
            extracted_text: text.to_string(),
            content_path: None,
            preview_path: None,
            last_extracted_at: Some(1),
            last_seen_at: 1,
            deleted: false,
            last_error: None,
            change_seq: 0,
        }
    }

    fn fixture() -> (tempfile::TempDir, MetadataStore, SearchIndex) {
        let temp = tempdir().expect("tempdir");
        let store = MetadataStore::open(&temp.path().join("metadata.db")).expect("store");
        let index = SearchIndex::open(&temp.path().join("search.db")).expect("index");
        (temp, store, index)
    }

    fn search(index: &SearchIndex, text: &str, field: Option<SearchField>) -> Vec<String> {
        index
            .search(&SearchQuery {
                text: text.to_string(),
                field,
                space: None,
                limit: 20,
            })
            .expect("search")
            .into_iter()
            .map(|hit| hit.diagram_id)
            .collect()
    }

    #[test]
    fn incremental_sync_tracks_changes_and_is_idempotent() {
        let (_temp, store, index) = fixture();
        store
            .upsert(record("DEMO", "a", "system", "Architecture", "Load Balancer"))
            .expect("a");
        store
            .upsert(record("DEMO", "b", "network", "Architecture", "Router"))
            .expect("b");

        let first = index.sync_incremental(&store).expect("first sync");
        assert_eq!(first.upserted, 2);
        assert_eq!(first.watermark_after, 2);
        assert!(first.convergence.converged);

        let second = index.sync_incremental(&store).expect("second sync");
        assert_eq!(second.upserted, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(second.watermark_after, 2);

        store
            .mark_unseen_as_deleted("DEMO", &HashSet::from([DiagramKey::new("DEMO", "100", "a")]))
            .expect("tombstone");
        let third = index.sync_incremental(&store).expect("third sync");
        assert_eq!(third.removed, 1);
        assert_eq!(third.documents, 1);
        assert!(third.convergence.converged);
        assert!(search(&index, "balancer", None).is_empty());
        assert_eq!(search(&index, "router", None), vec!["b"]);
    }

    #[test]
    fn rebuild_matches_incremental_result() {
        let (temp, store, index) = fixture();
        store
            .upsert(record("DEMO", "a", "system", "Architecture", "Load Balancer"))
            .expect("a");
        store
            .upsert(record("OPS", "c", "oncall", "Runbook", "Pager escalation"))
            .expect("c");
        index.sync_incremental(&store).expect("incremental");
        let incremental = index.indexed_identities().expect("identities");

        let other = SearchIndex::open(&temp.path().join("rebuilt.db")).expect("other index");
        let report = other.rebuild(&store, false).expect("rebuild");
        assert_eq!(report.mode, IndexMode::Rebuild);
        assert_eq!(other.indexed_identities().expect("identities"), incremental);
        assert!(report.convergence.converged);

        let again = other.rebuild(&store, false).expect("rebuild again");
        assert_eq!(again.documents, 2);
        assert_eq!(again.removed, 2);
    }

    #[test]
    fn format_mismatch_upgrades_incremental_to_rebuild() {
        let (_temp, store, index) = fixture();
        store
            .upsert(record("DEMO", "a", "system", "Architecture", "Load Balancer"))
            .expect("a");
        index.sync_incremental(&store).expect("sync");
        set_state(&index.connection, "format_version", "0").expect("downgrade");

        let report = index.sync_incremental(&store).expect("sync");
        assert_eq!(report.mode, IndexMode::Rebuild);
        assert!(report.format_rebuild);
        assert_eq!(index.format_version().expect("version"), Some(INDEX_FORMAT_VERSION));
    }

    #[test]
    fn search_supports_fields_prefixes_stemming_and_space_filter() {
        let (_temp, store, index) = fixture();
        store
            .upsert(record("DEMO", "a", "Load Balancer", "Architecture", "nginx upstream"))
            .expect("a");
        store
            .upsert(record("DEMO", "b", "network", "Balancer notes", "routing table"))
            .expect("b");
        store
            .upsert(record("OPS", "c", "pager", "Runbook", "balancer failover"))
            .expect("c");
        index.sync_incremental(&store).expect("sync");

        let mut all = search(&index, "balancer", None);
        all.sort();
        assert_eq!(all, vec!["a", "b", "c"]);
        assert_eq!(search(&index, "balancer", Some(SearchField::Name)), vec!["a"]);
        assert_eq!(search(&index, "balancer", Some(SearchField::Title)), vec!["b"]);
        assert_eq!(search(&index, "bal", Some(SearchField::Content)), vec!["c"]);
        assert_eq!(search(&index, "routes", None), vec!["b"]);
        assert!(search(&index, "  ?? ", None).is_empty());

        let scoped = index
            .search(&SearchQuery {
                text: "balancer".to_string(),
                field: None,
                space: Some("OPS".to_string()),
                limit: 10,
            })
            .expect("scoped search");
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].identity, "OPS/100/c");
    }

    #[test]
    fn prune_then_rebuild_drops_untargeted_spaces() {
        let (temp, store, index) = fixture();
        let content = ContentStore::new(temp.path().join("content"));
        for (space, diagram) in [("DEMO", "a"), ("OLD", "b")] {
            let written = content
                .write(space, diagram, crate::content_store::ContentKind::Native, b"<mxfile/>")
                .expect("write");
            let mut stored = record(space, diagram, "name", "title", "text");
            stored.content_path = Some(written.path);
            store.upsert(stored).expect("upsert");
        }
        index.sync_incremental(&store).expect("sync");

        let pruned =
            prune_untargeted_spaces(&store, &content, &["DEMO".to_string()]).expect("prune");
        assert_eq!(pruned.removed_spaces, vec!["OLD"]);
        assert_eq!(pruned.removed_content_dirs, 1);
        assert!(!temp.path().join("content/OLD").exists());

        let report = index.rebuild(&store, false).expect("rebuild");
        assert!(report.convergence.converged);
        assert_eq!(
            index.indexed_identities().expect("identities"),
            BTreeSet::from(["DEMO/100/a".to_string()])
        );
    }

    #[test]
    fn match_expression_quotes_terms() {
        assert_eq!(
            build_match_expression("load \"balancer", None).as_deref(),
            Some("\"load\" OR \"balancer\" *")
        );
        assert_eq!(
            build_match_expression("db", Some(SearchField::Name)).as_deref(),
            Some("diagram_name : \"db\" *")
        );
        assert!(build_match_expression("--", None).is_none());
    }

    #[test]
    fn open_existing_returns_none_without_index() {
        let temp = tempdir().expect("tempdir");
        assert!(
            SearchIndex::open_existing(&temp.path().join("search.db"))
                .expect("open")
                .is_none()
        );
    }
}
