use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::migrate;

const RECORD_COLUMNS: &str = "space_key, page_id, diagram_id, page_title, diagram_name,
    content_fingerprint, local_revision, extracted_text, content_path, preview_path,
    last_extracted_at, last_seen_at, deleted, last_error, change_seq";

/// Composite identity of one diagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiagramKey {
    pub space_key: String,
    pub page_id: String,
    pub diagram_id: String,
}

impl DiagramKey {
    pub fn new(
        space_key: impl Into<String>,
        page_id: impl Into<String>,
        diagram_id: impl Into<String>,
    ) -> Self {
        Self {
            space_key: space_key.into(),
            page_id: page_id.into(),
            diagram_id: diagram_id.into(),
        }
    }

    /// Stable `space/page/diagram` form; components are percent-encoded so the
    /// mapping stays reversible.
    pub fn identity(&self) -> String {
        format!(
            "{}/{}/{}",
            urlencoding::encode(&self.space_key),
            urlencoding::encode(&self.page_id),
            urlencoding::encode(&self.diagram_id)
        )
    }

    pub fn parse(identity: &str) -> Result<Self> {
        let mut parts = identity.split('/');
        let (Some(space), Some(page), Some(diagram), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            bail!("identity must have the form space/page/diagram: {identity}");
        };
        let decode = |part: &str| -> Result<String> {
            if part.is_empty() {
                bail!("identity has an empty component: {identity}");
            }
            Ok(urlencoding::decode(part)
                .with_context(|| format!("identity is not valid percent-encoding: {identity}"))?
                .into_owned())
        };
        Ok(Self::new(decode(space)?, decode(page)?, decode(diagram)?))
    }
}

impl fmt::Display for DiagramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagramRecord {
    pub space_key: String,
    pub page_id: String,
    pub diagram_id: String,
    pub page_title: String,
    pub diagram_name: String,
    pub content_fingerprint: String,
    pub local_revision: i64,
    pub extracted_text: String,
    pub content_path: Option<String>,
    pub preview_path: Option<String>,
    pub last_extracted_at: Option<i64>,
    pub last_seen_at: i64,
    pub deleted: bool,
    pub last_error: Option<String>,
    pub change_seq: i64,
}

impl DiagramRecord {
    pub fn key(&self) -> DiagramKey {
        DiagramKey::new(&self.space_key, &self.page_id, &self.diagram_id)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            space_key: row.get(0)?,
            page_id: row.get(1)?,
            diagram_id: row.get(2)?,
            page_title: row.get(3)?,
            diagram_name: row.get(4)?,
            content_fingerprint: row.get(5)?,
            local_revision: row.get(6)?,
            extracted_text: row.get(7)?,
            content_path: row.get(8)?,
            preview_path: row.get(9)?,
            last_extracted_at: row.get(10)?,
            last_seen_at: row.get(11)?,
            deleted: row.get::<_, i64>(12)? != 0,
            last_error: row.get(13)?,
            change_seq: row.get(14)?,
        })
    }
}

/// Refresh for a diagram whose remote fingerprint did not change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenUpdate {
    pub key: DiagramKey,
    pub page_title: String,
    pub diagram_name: String,
    pub seen_at: i64,
}

/// One unit of work inside a metadata checkpoint.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Create or replace a record. `local_revision`, `change_seq` and
    /// `deleted` on the input are ignored and computed by the store.
    Upsert(DiagramRecord),
    Seen(SeenUpdate),
    RecordFailure { key: DiagramKey, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub refreshed: usize,
    pub revived: usize,
    pub failures_recorded: usize,
    /// Seen/failure ops that referenced no stored row.
    pub missing: usize,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub records: Vec<DiagramRecord>,
    /// Highest change sequence visible to the same read transaction.
    pub change_seq: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceSummary {
    pub space_key: String,
    pub diagrams: usize,
    pub last_seen_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub active: usize,
    pub deleted: usize,
    pub with_errors: usize,
    pub spaces: usize,
    pub change_seq: i64,
}

/// SQLite-backed record store. Each instance owns one connection; workers
/// open their own instance on the same database file.
pub struct MetadataStore {
    connection: Connection,
    db_path: PathBuf,
}

impl fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl MetadataStore {
    /// Opens (creating when needed) the store and applies pending migrations.
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = open_connection(db_path)?;
        let report = migrate::apply_pending(&connection)?;
        if !report.applied.is_empty() {
            debug!(
                applied = report.applied.len(),
                version = report.current_version,
                "metadata schema migrated"
            );
        }
        Ok(Self {
            connection,
            db_path: db_path.to_path_buf(),
        })
    }

    /// Opens an existing store without creating one.
    pub fn open_existing(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            bail!(
                "metadata store not found at {}\nRun: drawsync extract",
                db_path.display()
            );
        }
        Self::open(db_path)
    }

    /// Read-only handle that never creates or migrates anything; `None` when
    /// no store exists yet.
    pub fn open_read_only(db_path: &Path) -> Result<Option<Self>> {
        if !db_path.exists() {
            return Ok(None);
        }
        let connection = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open {} read-only", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        let version = migrate::current_version(&connection).with_context(|| {
            format!("metadata store at {} has no schema", db_path.display())
        })?;
        if version < migrate::latest_version() {
            bail!(
                "metadata store at {} is at schema v{version}, expected v{}\nRun: drawsync extract",
                db_path.display(),
                migrate::latest_version()
            );
        }
        Ok(Some(Self {
            connection,
            db_path: db_path.to_path_buf(),
        }))
    }

    pub fn get(&self, key: &DiagramKey) -> Result<Option<DiagramRecord>> {
        self.connection
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM diagrams
                     WHERE space_key = ?1 AND page_id = ?2 AND diagram_id = ?3"
                ),
                params![key.space_key, key.page_id, key.diagram_id],
                DiagramRecord::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load diagram {key}"))
    }

    pub fn upsert(&self, record: DiagramRecord) -> Result<DiagramRecord, PipelineError> {
        let key = record.key();
        self.apply_batch(&[StoreOp::Upsert(record)])?;
        self.get(&key)
            .map_err(PipelineError::store_write)?
            .ok_or_else(|| PipelineError::StoreWriteFailure(format!("{key} vanished after upsert")))
    }

    /// Commits all ops in one transaction or none of them.
    pub fn apply_batch(&self, ops: &[StoreOp]) -> Result<BatchOutcome, PipelineError> {
        self.apply_batch_inner(ops)
            .map_err(PipelineError::store_write)
    }

    fn apply_batch_inner(&self, ops: &[StoreOp]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if ops.is_empty() {
            return Ok(outcome);
        }
        let tx = self.begin_write()?;
        for op in ops {
            match op {
                StoreOp::Upsert(record) => apply_upsert(&tx, record, &mut outcome)?,
                StoreOp::Seen(update) => apply_seen(&tx, update, &mut outcome)?,
                StoreOp::RecordFailure { key, reason } => {
                    apply_failure(&tx, key, reason, &mut outcome)?
                }
            }
        }
        tx.commit().context("failed to commit metadata batch")?;
        Ok(outcome)
    }

    /// Tombstones every active record of `space_key` whose identity is not in `seen`.
    pub fn mark_unseen_as_deleted(
        &self,
        space_key: &str,
        seen: &HashSet<DiagramKey>,
    ) -> Result<Vec<DiagramKey>, PipelineError> {
        self.mark_unseen_inner(space_key, seen)
            .map_err(PipelineError::store_write)
    }

    fn mark_unseen_inner(
        &self,
        space_key: &str,
        seen: &HashSet<DiagramKey>,
    ) -> Result<Vec<DiagramKey>> {
        let tx = self.begin_write()?;
        let active = {
            let mut statement = tx
                .prepare(
                    "SELECT page_id, diagram_id FROM diagrams
                     WHERE space_key = ?1 AND deleted = 0",
                )
                .context("failed to prepare active identity query")?;
            let rows = statement
                .query_map([space_key], |row| {
                    Ok(DiagramKey::new(space_key, row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .context("failed to query active identities")?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.context("failed to decode active identity")?);
            }
            keys
        };

        let mut tombstoned = Vec::new();
        for key in active {
            if seen.contains(&key) {
                continue;
            }
            let seq = next_change_seq(&tx)?;
            tx.execute(
                "UPDATE diagrams SET deleted = 1, change_seq = ?4
                 WHERE space_key = ?1 AND page_id = ?2 AND diagram_id = ?3",
                params![key.space_key, key.page_id, key.diagram_id, seq],
            )
            .with_context(|| format!("failed to tombstone {key}"))?;
            tombstoned.push(key);
        }
        tx.commit().context("failed to commit tombstones")?;
        tombstoned.sort();
        Ok(tombstoned)
    }

    /// Records (including tombstones) whose change sequence is above `watermark`.
    pub fn list_changed_since(&self, watermark: i64) -> Result<Vec<DiagramRecord>> {
        query_records(
            &self.connection,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM diagrams WHERE change_seq > ?1 ORDER BY change_seq"
            ),
            params![watermark],
        )
    }

    pub fn list_all_active(&self, space_key: Option<&str>) -> Result<Vec<DiagramRecord>> {
        match space_key {
            Some(space) => query_records(
                &self.connection,
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM diagrams
                     WHERE deleted = 0 AND space_key = ?1
                     ORDER BY page_title, diagram_name, page_id, diagram_id"
                ),
                params![space],
            ),
            None => query_records(
                &self.connection,
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM diagrams
                     WHERE deleted = 0
                     ORDER BY space_key, page_title, diagram_name, page_id, diagram_id"
                ),
                [],
            ),
        }
    }

    pub fn list_space(&self, space_key: &str) -> Result<Vec<DiagramRecord>> {
        self.list_all_active(Some(space_key))
    }

    pub fn current_change_seq(&self) -> Result<i64> {
        read_change_seq(&self.connection)
    }

    pub fn snapshot_changed_since(&self, watermark: i64) -> Result<Snapshot> {
        let tx = self
            .connection
            .unchecked_transaction()
            .context("failed to begin metadata read transaction")?;
        let change_seq = read_change_seq(&tx)?;
        let records = query_records(
            &tx,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM diagrams WHERE change_seq > ?1 ORDER BY change_seq"
            ),
            params![watermark],
        )?;
        tx.commit().context("failed to end metadata read transaction")?;
        Ok(Snapshot {
            records,
            change_seq,
        })
    }

    pub fn snapshot_active(&self) -> Result<Snapshot> {
        let tx = self
            .connection
            .unchecked_transaction()
            .context("failed to begin metadata read transaction")?;
        let change_seq = read_change_seq(&tx)?;
        let records = query_records(
            &tx,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM diagrams WHERE deleted = 0
                 ORDER BY space_key, page_id, diagram_id"
            ),
            [],
        )?;
        tx.commit().context("failed to end metadata read transaction")?;
        Ok(Snapshot {
            records,
            change_seq,
        })
    }

    pub fn list_space_summaries(&self) -> Result<Vec<SpaceSummary>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT space_key, COUNT(*), MAX(last_seen_at) FROM diagrams
                 WHERE deleted = 0 GROUP BY space_key ORDER BY space_key",
            )
            .context("failed to prepare space summary query")?;
        let rows = statement
            .query_map([], |row| {
                Ok(SpaceSummary {
                    space_key: row.get(0)?,
                    diagrams: usize::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                    last_seen_at: row.get(2)?,
                })
            })
            .context("failed to run space summary query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode space summary row")?);
        }
        Ok(out)
    }

    /// Physically removes every record whose space is not in `targets` and
    /// returns the removed rows so their content can be deleted too.
    pub fn prune_spaces_not_in(
        &self,
        targets: &[String],
    ) -> Result<Vec<DiagramRecord>, PipelineError> {
        self.prune_inner(targets).map_err(PipelineError::store_write)
    }

    fn prune_inner(&self, targets: &[String]) -> Result<Vec<DiagramRecord>> {
        if targets.is_empty() {
            bail!("refusing to prune with an empty target space list");
        }
        let keep: BTreeSet<&str> = targets.iter().map(String::as_str).collect();
        let tx = self.begin_write()?;
        let all = query_records(
            &tx,
            &format!("SELECT {RECORD_COLUMNS} FROM diagrams ORDER BY space_key, page_id, diagram_id"),
            [],
        )?;
        let removed: Vec<DiagramRecord> = all
            .into_iter()
            .filter(|record| !keep.contains(record.space_key.as_str()))
            .collect();
        let spaces: BTreeSet<&str> = removed.iter().map(|r| r.space_key.as_str()).collect();
        for space in spaces {
            tx.execute("DELETE FROM diagrams WHERE space_key = ?1", [space])
                .with_context(|| format!("failed to prune space {space}"))?;
        }
        tx.commit().context("failed to commit prune")?;
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (total, active, deleted, with_errors, spaces) = self
            .connection
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(deleted = 0), 0),
                        COALESCE(SUM(deleted = 1), 0),
                        COALESCE(SUM(deleted = 0 AND last_error IS NOT NULL), 0),
                        COUNT(DISTINCT CASE WHEN deleted = 0 THEN space_key END)
                 FROM diagrams",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .context("failed to read metadata stats")?;
        let count = |value: i64| usize::try_from(value).unwrap_or(0);
        Ok(StoreStats {
            total: count(total),
            active: count(active),
            deleted: count(deleted),
            with_errors: count(with_errors),
            spaces: count(spaces),
            change_seq: self.current_change_seq()?,
        })
    }

    /// `BEGIN IMMEDIATE` serializes writers on the revision and sequence reads.
    fn begin_write(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.connection, TransactionBehavior::Immediate)
            .context("failed to begin metadata write transaction")
    }
}

fn apply_upsert(
    connection: &Connection,
    record: &DiagramRecord,
    outcome: &mut BatchOutcome,
) -> Result<()> {
    let key = record.key();
    let existing = connection
        .query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM diagrams
                 WHERE space_key = ?1 AND page_id = ?2 AND diagram_id = ?3"
            ),
            params![key.space_key, key.page_id, key.diagram_id],
            DiagramRecord::from_row,
        )
        .optional()
        .with_context(|| format!("failed to read current revision of {key}"))?;

    // Revision and extraction time only move when the content changes.
    // Records listed but never fetched carry no extraction and stay at revision 0.
    let extracted = i64::from(record.last_extracted_at.is_some());
    let (revision, last_extracted_at) = match &existing {
        None => {
            outcome.created += 1;
            (extracted, record.last_extracted_at)
        }
        Some(current) => {
            outcome.updated += 1;
            if current.deleted {
                outcome.revived += 1;
            }
            if current.content_fingerprint == record.content_fingerprint {
                (current.local_revision, current.last_extracted_at)
            } else {
                (current.local_revision + extracted, record.last_extracted_at)
            }
        }
    };

    if let Some(current) = &existing
        && !current.deleted
        && same_indexed_state(current, record)
    {
        connection
            .execute(
                "UPDATE diagrams SET last_seen_at = MAX(last_seen_at, ?4)
                 WHERE space_key = ?1 AND page_id = ?2 AND diagram_id = ?3",
                params![key.space_key, key.page_id, key.diagram_id, record.last_seen_at],
            )
            .with_context(|| format!("failed to refresh {key}"))?;
        return Ok(());
    }

    let seq = next_change_seq(connection)?;

    connection
        .execute(
            "INSERT INTO diagrams (
                space_key, page_id, diagram_id, page_title, diagram_name,
                content_fingerprint, local_revision, extracted_text, content_path,
                preview_path, last_extracted_at, last_seen_at, deleted, last_error, change_seq
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?14)
             ON CONFLICT(space_key, page_id, diagram_id) DO UPDATE SET
                page_title = excluded.page_title,
                diagram_name = excluded.diagram_name,
                content_fingerprint = excluded.content_fingerprint,
                local_revision = excluded.local_revision,
                extracted_text = excluded.extracted_text,
                content_path = excluded.content_path,
                preview_path = excluded.preview_path,
                last_extracted_at = excluded.last_extracted_at,
                last_seen_at = excluded.last_seen_at,
                deleted = 0,
                last_error = excluded.last_error,
                change_seq = excluded.change_seq",
            params![
                record.space_key,
                record.page_id,
                record.diagram_id,
                record.page_title,
                record.diagram_name,
                record.content_fingerprint,
                revision,
                record.extracted_text,
                record.content_path,
                record.preview_path,
                last_extracted_at,
                record.last_seen_at,
                record.last_error,
                seq,
            ],
        )
        .with_context(|| format!("failed to upsert {key}"))?;
    Ok(())
}

/// Fields that would change what a reader or the search index sees.
fn same_indexed_state(current: &DiagramRecord, incoming: &DiagramRecord) -> bool {
    current.content_fingerprint == incoming.content_fingerprint
        && current.page_title == incoming.page_title
        && current.diagram_name == incoming.diagram_name
        && current.extracted_text == incoming.extracted_text
        && current.content_path == incoming.content_path
        && current.preview_path == incoming.preview_path
        && current.last_error == incoming.last_error
}

fn apply_seen(connection: &Connection, update: &SeenUpdate, outcome: &mut BatchOutcome) -> Result<()> {
    let key = &update.key;
    let existing: Option<(String, String, i64)> = connection
        .query_row(
            "SELECT page_title, diagram_name, deleted FROM diagrams
             WHERE space_key = ?1 AND page_id = ?2 AND diagram_id = ?3",
            params![key.space_key, key.page_id, key.diagram_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .with_context(|| format!("failed to read {key}"))?;

    let Some((page_title, diagram_name, deleted)) = existing else {
        outcome.missing += 1;
        return Ok(());
    };

    let revived = deleted != 0;
    let display_changed = page_title != update.page_title || diagram_name != update.diagram_name;
    if revived || display_changed {
        let seq = next_change_seq(connection)?;
        connection
            .execute(
                "UPDATE diagrams SET page_title = ?4, diagram_name = ?5, last_seen_at = ?6,
                    deleted = 0, change_seq = ?7
                 WHERE space_key = ?1 AND page_id = ?2 AND diagram_id = ?3",
                params![
                    key.space_key,
                    key.page_id,
                    key.diagram_id,
                    update.page_title,
                    update.diagram_name,
                    update.seen_at,
                    seq
                ],
            )
            .with_context(|| format!("failed to refresh {key}"))?;
    } else {
        connection
            .execute(
                "UPDATE diagrams SET last_seen_at = ?4
                 WHERE space_key = ?1 AND page_id = ?2 AND diagram_id = ?3",
                params![key.space_key, key.page_id, key.diagram_id, update.seen_at],
            )
            .with_context(|| format!("failed to refresh {key}"))?;
    }
    outcome.refreshed += 1;
    if revived {
        outcome.revived += 1;
    }
    Ok(())
}

fn apply_failure(
    connection: &Connection,
    key: &DiagramKey,
    reason: &str,
    outcome: &mut BatchOutcome,
) -> Result<()> {
    let changed = connection
        .execute(
            "UPDATE diagrams SET last_error = ?4
             WHERE space_key = ?1 AND page_id = ?2 AND diagram_id = ?3",
            params![key.space_key, key.page_id, key.diagram_id, reason],
        )
        .with_context(|| format!("failed to record failure for {key}"))?;
    if changed == 0 {
        outcome.missing += 1;
    } else {
        outcome.failures_recorded += 1;
    }
    Ok(())
}

fn next_change_seq(connection: &Connection) -> Result<i64> {
    connection
        .execute(
            "INSERT INTO store_state (key, value) VALUES ('change_seq', '1')
             ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
            [],
        )
        .context("failed to advance change sequence")?;
    read_change_seq(connection)
}

fn read_change_seq(connection: &Connection) -> Result<i64> {
    let value: Option<i64> = connection
        .query_row(
            "SELECT CAST(value AS INTEGER) FROM store_state WHERE key = 'change_seq'",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read change sequence")?;
    Ok(value.unwrap_or(0))
}

fn query_records<P: rusqlite::Params>(
    connection: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<DiagramRecord>> {
    let mut statement = connection
        .prepare(sql)
        .context("failed to prepare diagram query")?;
    let rows = statement
        .query_map(params, DiagramRecord::from_row)
        .context("failed to run diagram query")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode diagram row")?);
    }
    Ok(out)
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create database parent directory {}",
                parent.display()
            )
        })?;
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

pub fn unix_timestamp() -> Result<i64> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system clock error")?
        .as_secs();
    i64::try_from(now).context("timestamp does not fit into i64")
}
