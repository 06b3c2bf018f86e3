use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::metadata::{open_connection, unix_timestamp};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: "CREATE TABLE IF NOT EXISTS diagrams (
                space_key TEXT NOT NULL,
                page_id TEXT NOT NULL,
                diagram_id TEXT NOT NULL,
                page_title TEXT NOT NULL,
                diagram_name TEXT NOT NULL,
                content_fingerprint TEXT NOT NULL,
                local_revision INTEGER NOT NULL DEFAULT 1,
                extracted_text TEXT NOT NULL DEFAULT '',
                content_path TEXT,
                preview_path TEXT,
                last_extracted_at INTEGER,
                last_seen_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (space_key, page_id, diagram_id)
            );
            CREATE TABLE IF NOT EXISTS store_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
    },
    Migration {
        version: 2,
        name: "change_tracking",
        sql: "ALTER TABLE diagrams ADD COLUMN change_seq INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE diagrams ADD COLUMN last_error TEXT;
            INSERT INTO store_state (key, value) VALUES ('change_seq', '0')
                ON CONFLICT(key) DO NOTHING;",
    },
    Migration {
        version: 3,
        name: "indexes",
        sql: "CREATE INDEX IF NOT EXISTS idx_diagrams_change_seq ON diagrams(change_seq);
            CREATE INDEX IF NOT EXISTS idx_diagrams_space_active ON diagrams(space_key, deleted);",
    },
];

/// Report returned after running migrations.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Run all pending migrations against the metadata database at `db_path`.
/// Creates the database and parent directories if they do not exist.
pub fn run_migrations(db_path: &Path) -> Result<MigrateReport> {
    let connection = open_connection(db_path)?;
    apply_pending(&connection)
}

/// Applies pending migrations on an already open connection.
pub fn apply_pending(connection: &Connection) -> Result<MigrateReport> {
    ensure_schema_migrations_table(connection)?;

    let current = current_version(connection)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    let final_version = current_version(connection)?;
    Ok(MigrateReport {
        applied,
        current_version: final_version,
    })
}

/// Returns the number of migrations that have not yet been applied.
pub fn pending_migration_count(db_path: &Path) -> Result<usize> {
    if !db_path.exists() {
        return Ok(MIGRATIONS.len());
    }
    let connection = open_connection(db_path)?;
    ensure_schema_migrations_table(&connection)?;
    let current = current_version(&connection)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).count())
}

/// Returns the highest applied migration version, or 0 if none applied.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    connection
        .execute_batch("SAVEPOINT migration_apply")
        .context("failed to create savepoint")?;

    let result = (|| -> Result<()> {
        connection
            .execute_batch(migration.sql)
            .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;

        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![
                    i64::from(migration.version),
                    migration.name,
                    unix_timestamp()?,
                ],
            )
            .context("failed to record migration")?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            connection
                .execute_batch("RELEASE SAVEPOINT migration_apply")
                .context("failed to release savepoint")?;
            Ok(())
        }
        Err(err) => {
            let _ = connection.execute_batch("ROLLBACK TO SAVEPOINT migration_apply");
            let _ = connection.execute_batch("RELEASE SAVEPOINT migration_apply");
            Err(err)
        }
    }
}
