use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::annotations::{
    Annotation, AnnotationError, AnnotationPersistence, AnnotationRecord, AnnotationResult,
};
use crate::db::{BinaryRecord, CalculationRunRecord, FixupRecord, RunStatus};

/// Minimum schema version we know how to handle.
///
/// `0` means "no schema yet" (fresh DB).
const MIN_SUPPORTED_SCHEMA_VERSION: i32 = 0;

/// Latest schema version this crate knows about.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Error type for project database operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying SQLite error.
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// The database was created with a newer schema version than we support.
    #[error(
        "Unsupported schema version {found}; supported range is {min_supported}..={max_supported}"
    )]
    UnsupportedSchemaVersion { found: i32, min_supported: i32, max_supported: i32 },

    /// A stored annotation row could not be encoded or decoded.
    #[error("Annotation row for binary '{binary}' is invalid: {source}")]
    Annotation {
        binary: String,
        #[source]
        source: AnnotationError,
    },

    #[error("Stored run status '{0}' is not recognized")]
    InvalidRunStatus(String),
}

/// Convenience result type for DB operations.
pub type DbResult<T> = Result<T, DbError>;

/// SQLite-backed project database.
///
/// Holds the binaries registered with a project, the annotation set of each
/// binary, and the bookkeeping of past state calculations with their fixups.
#[derive(Debug)]
pub struct ProjectDb {
    conn: Connection,
}

impl ProjectDb {
    /// Open (or create) a project database at the given path and ensure the schema exists.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        apply_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Expose a reference to the underlying connection for advanced callers.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Insert a binary record and return its row id.
    pub fn insert_binary(&self, record: &BinaryRecord) -> DbResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO binaries (name, path, arch, hash)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![record.name, record.path, record.arch, record.hash],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// List all binaries (ordered by id).
    pub fn list_binaries(&self) -> DbResult<Vec<BinaryRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT name, path, arch, hash
            FROM binaries
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], map_binary)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_binary(&self, name: &str) -> DbResult<Option<BinaryRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT name, path, arch, hash FROM binaries WHERE name = ?1",
                params![name],
                map_binary,
            )
            .optional()?;
        Ok(record)
    }

    /// Record the architecture reported by the loader once the binary has been opened.
    pub fn update_binary_arch(&self, name: &str, arch: &str) -> DbResult<usize> {
        let affected = self
            .conn
            .execute("UPDATE binaries SET arch = ?1 WHERE name = ?2", params![arch, name])?;
        Ok(affected)
    }

    /// Replace the stored annotation set of `binary`, preserving order.
    pub fn save_annotations(&self, binary: &str, annotations: &[Annotation]) -> DbResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM annotations WHERE binary = ?1", params![binary])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO annotations (binary, position, kind, address, fields)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;
            for (position, annotation) in annotations.iter().enumerate() {
                let record = AnnotationRecord::from_annotation(annotation)
                    .map_err(|source| DbError::Annotation { binary: binary.to_string(), source })?;
                stmt.execute(params![
                    binary,
                    position as i64,
                    record.kind,
                    record.address as i64,
                    record.fields.to_string()
                ])?;
            }
        }
        tx.commit()?;
        log::debug!("stored {} annotations for {binary}", annotations.len());
        Ok(())
    }

    /// Load the annotation set of `binary` in stored order; empty when none were saved.
    pub fn load_annotations(&self, binary: &str) -> DbResult<Vec<Annotation>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT kind, address, fields FROM annotations
            WHERE binary = ?1
            ORDER BY position
            "#,
        )?;
        let rows = stmt.query_map(params![binary], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64, row.get::<_, String>(2)?))
        })?;

        let invalid = |source: AnnotationError| DbError::Annotation { binary: binary.to_string(), source };
        let mut out = Vec::new();
        for row in rows {
            let (kind, address, fields) = row?;
            let fields = serde_json::from_str(&fields).map_err(|e| invalid(e.into()))?;
            let record = AnnotationRecord { kind, address, fields };
            out.push(record.into_annotation().map_err(invalid)?);
        }
        Ok(out)
    }

    /// Insert a calculation run record and return its row id.
    pub fn insert_calculation_run(&self, record: &CalculationRunRecord) -> DbResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO calculation_runs (binary, update_function, status, started_at, finished_at, fixup_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.binary,
                record.update_function,
                record.status.as_str(),
                record.started_at,
                record.finished_at,
                record.fixup_count as i64
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Persist the fixups produced by run `run_id`.
    pub fn insert_fixups(&self, run_id: i64, fixups: &[FixupRecord]) -> DbResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO state_fixups (run_id, idx, address, kind, expected, computed, resolution)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for (idx, fixup) in fixups.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    idx as i64,
                    fixup.address as i64,
                    fixup.kind,
                    fixup.expected,
                    fixup.computed,
                    fixup.resolution
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// List calculation runs, optionally filtered by binary name.
    pub fn list_runs(&self, binary: Option<&str>) -> DbResult<Vec<CalculationRunRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, binary, update_function, status, started_at, finished_at, fixup_count
            FROM calculation_runs
            WHERE ?1 IS NULL OR binary = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![binary], |row| {
            Ok((
                CalculationRunRecord {
                    id: Some(row.get(0)?),
                    binary: row.get(1)?,
                    update_function: row.get(2)?,
                    status: RunStatus::Failed,
                    started_at: row.get(4)?,
                    finished_at: row.get(5)?,
                    fixup_count: row.get::<_, i64>(6)? as usize,
                },
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (mut record, status) = row?;
            record.status =
                RunStatus::parse(&status).ok_or_else(|| DbError::InvalidRunStatus(status.clone()))?;
            out.push(record);
        }
        Ok(out)
    }

    /// Most recent run id for a binary, if any.
    pub fn latest_run_id(&self, binary: &str) -> DbResult<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM calculation_runs WHERE binary = ?1 ORDER BY id DESC LIMIT 1",
                params![binary],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Fixups of one run, in the order they were produced.
    pub fn list_fixups(&self, run_id: i64) -> DbResult<Vec<FixupRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT address, kind, expected, computed, resolution
            FROM state_fixups
            WHERE run_id = ?1
            ORDER BY idx
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(FixupRecord {
                address: row.get::<_, i64>(0)? as u64,
                kind: row.get(1)?,
                expected: row.get(2)?,
                computed: row.get(3)?,
                resolution: row.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Persistence view scoped to one binary's annotations.
    pub fn annotations_for<'a>(&'a self, binary: &'a str) -> BinaryAnnotations<'a> {
        BinaryAnnotations { db: self, binary }
    }
}

fn map_binary(row: &rusqlite::Row<'_>) -> rusqlite::Result<BinaryRecord> {
    Ok(BinaryRecord { name: row.get(0)?, path: row.get(1)?, arch: row.get(2)?, hash: row.get(3)? })
}

/// The annotation set of one binary, stored in the project database.
#[derive(Debug, Clone, Copy)]
pub struct BinaryAnnotations<'a> {
    db: &'a ProjectDb,
    binary: &'a str,
}

impl BinaryAnnotations<'_> {
    pub fn binary(&self) -> &str {
        self.binary
    }
}

impl AnnotationPersistence for BinaryAnnotations<'_> {
    fn load_annotations(&self) -> AnnotationResult<Vec<Annotation>> {
        self.db.load_annotations(self.binary).map_err(into_annotation_error)
    }

    fn save_annotations(&self, annotations: &[Annotation]) -> AnnotationResult<()> {
        self.db.save_annotations(self.binary, annotations).map_err(into_annotation_error)
    }
}

fn into_annotation_error(err: DbError) -> AnnotationError {
    match err {
        DbError::Annotation { source, .. } => source,
        other => AnnotationError::Storage(other.to_string()),
    }
}

/// Apply schema migrations to bring the database to the latest version.
///
/// We use `PRAGMA user_version` as the schema version indicator.
///
/// Version map:
/// - 0: no schema
/// - 1: binaries and per-binary annotations
/// - 2: calculation_runs and state_fixups
fn apply_migrations(conn: &Connection) -> DbResult<()> {
    let mut current_version = current_schema_version(conn)?;

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            found: current_version,
            min_supported: MIN_SUPPORTED_SCHEMA_VERSION,
            max_supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS binaries (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL,
                arch TEXT,
                hash TEXT
            );

            CREATE TABLE IF NOT EXISTS annotations (
                binary   TEXT NOT NULL,
                position INTEGER NOT NULL,
                kind     TEXT NOT NULL,
                address  INTEGER NOT NULL,
                fields   TEXT NOT NULL,
                PRIMARY KEY(binary, position)
            );

            PRAGMA user_version = 1;
            COMMIT;
            "#,
        )?;
        current_version = 1;
    }

    if current_version < 2 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS calculation_runs (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                binary          TEXT NOT NULL,
                update_function TEXT NOT NULL,
                status          TEXT NOT NULL,
                started_at      TEXT NOT NULL,
                finished_at     TEXT NOT NULL,
                fixup_count     INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS state_fixups (
                run_id     INTEGER NOT NULL,
                idx        INTEGER NOT NULL,
                address    INTEGER NOT NULL,
                kind       TEXT NOT NULL,
                expected   TEXT,
                computed   TEXT NOT NULL,
                resolution TEXT NOT NULL,
                PRIMARY KEY(run_id, idx)
            );

            PRAGMA user_version = 2;
            COMMIT;
            "#,
        )?;
    }

    Ok(())
}

/// Read the SQLite schema version from `PRAGMA user_version`.
fn current_schema_version(conn: &Connection) -> DbResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(version)
}
