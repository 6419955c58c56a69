//! Document store over SQLite.
//!
//! RULE: Only the store module talks to the database. Everything above
//! it sees an opaque document store: named collections of JSON
//! documents with cursor-based batch reads and keyed upserts.
//!
//! Each collection is one table of `(id, doc_key, body)` rows — `body`
//! is the JSON document, `doc_key` the optional upsert key. Collections
//! are created on demand; the migration file only seeds the fixed
//! `formulas` and `job_run` tables.

mod cursor;

pub use cursor::BatchCursor;

use crate::{
    error::{EngineError, EngineResult},
    formula::FormulaDocument,
    types::{Document, RunId},
};
use rusqlite::{params, Connection, OptionalExtension};

/// Collection holding one FormulaDocument per report.
pub const FORMULAS_COLLECTION: &str = "formulas";

/// One record read from a source collection, with its storage id.
/// The id feeds the mapping-key fallback when no key fields are
/// configured.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: i64,
    pub doc: Document,
}

/// Persisted outcome of one scheduled run.
#[derive(Debug, Clone)]
pub struct JobRunRow {
    pub run_id: RunId,
    pub started_at: String,
    pub finished_at: String,
    pub status: String,
    pub reports_processed: u64,
    pub documents_processed: u64,
    pub documents_skipped: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

pub struct DocStore {
    conn: Connection,
}

impl DocStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        // WAL mode: better concurrent read performance on real files.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        Ok(Self { conn })
    }

    /// Open an in-memory store (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Apply schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(include_str!("../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    // ── Collections ────────────────────────────────────────────

    /// Create a collection table if it does not exist yet.
    pub fn ensure_collection(&self, collection: &str) -> EngineResult<()> {
        let name = checked_name(collection)?;
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_key TEXT UNIQUE,
                body    TEXT NOT NULL
            );"
        ))?;
        Ok(())
    }

    pub fn collection_exists(&self, collection: &str) -> EngineResult<bool> {
        let name = checked_name(collection)?;
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count_documents(&self, collection: &str) -> EngineResult<u64> {
        if !self.collection_exists(collection)? {
            return Ok(0);
        }
        let name = checked_name(collection)?;
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    // ── Documents ──────────────────────────────────────────────

    /// Append a document without a key. Returns its storage id.
    pub fn insert_document(&self, collection: &str, doc: &Document) -> EngineResult<i64> {
        self.ensure_collection(collection)?;
        let name = checked_name(collection)?;
        let body = serde_json::to_string(doc)?;
        self.conn.execute(
            &format!("INSERT INTO \"{name}\" (body) VALUES (?1)"),
            params![body],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert or replace the document stored under `key`. Repeated
    /// calls with identical input leave identical stored state.
    pub fn upsert(&self, collection: &str, key: &str, doc: &Document) -> EngineResult<()> {
        self.ensure_collection(collection)?;
        let name = checked_name(collection)?;
        let body = serde_json::to_string(doc)?;
        self.conn.execute(
            &format!(
                "INSERT INTO \"{name}\" (doc_key, body) VALUES (?1, ?2)
                 ON CONFLICT(doc_key) DO UPDATE SET body = excluded.body"
            ),
            params![key, body],
        )?;
        Ok(())
    }

    pub fn get_by_key(&self, collection: &str, key: &str) -> EngineResult<Option<Document>> {
        if !self.collection_exists(collection)? {
            return Ok(None);
        }
        let name = checked_name(collection)?;
        let body: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT body FROM \"{name}\" WHERE doc_key = ?1"),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// All documents of a collection in storage order. For tests and
    /// small collections only — batch processing goes through
    /// `BatchCursor`.
    pub fn get_all(&self, collection: &str) -> EngineResult<Vec<(i64, Document)>> {
        if !self.collection_exists(collection)? {
            return Ok(Vec::new());
        }
        let name = checked_name(collection)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id, body FROM \"{name}\" ORDER BY id ASC"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, body)| Ok((id, serde_json::from_str(&body)?)))
            .collect()
    }

    /// Forward-only batch cursor over a collection. `filter` restricts
    /// the scan to documents whose fields equal the given values.
    pub fn stream<'a>(
        &'a self,
        collection: &str,
        filter: Option<&serde_json::Map<String, serde_json::Value>>,
        batch_size: usize,
    ) -> EngineResult<BatchCursor<'a>> {
        BatchCursor::new(self, collection, filter, batch_size)
    }

    // ── Formula documents ──────────────────────────────────────

    /// Store a formula document, keyed by report name.
    pub fn save_formula_document(&self, doc: &FormulaDocument) -> EngineResult<()> {
        let value = serde_json::to_value(doc)?;
        let map = value
            .as_object()
            .cloned()
            .ok_or_else(|| EngineError::Config {
                report: doc.report_name.clone(),
                reason: "formula document did not serialize to an object".into(),
            })?;
        self.upsert(FORMULAS_COLLECTION, &doc.report_name, &map)
    }

    /// Load every configured FormulaDocument. A structurally malformed
    /// document is a configuration problem scoped to that report: it is
    /// logged and skipped, never fatal. Only failing to read the
    /// collection itself aborts the whole run — the caller maps that to
    /// a connectivity failure.
    pub fn load_formula_documents(&self) -> EngineResult<Vec<FormulaDocument>> {
        let docs = self.get_all(FORMULAS_COLLECTION)?;
        let mut out = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            match serde_json::from_value(serde_json::Value::Object(doc)) {
                Ok(parsed) => out.push(parsed),
                Err(e) => {
                    log::warn!("skipping malformed formula document (row {id}): {e}");
                }
            }
        }
        Ok(out)
    }

    // ── Job run log ────────────────────────────────────────────

    pub fn insert_job_run(&self, run: &JobRunRow) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO job_run
             (run_id, started_at, finished_at, status, reports_processed,
              documents_processed, documents_skipped, errors, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.run_id,
                run.started_at,
                run.finished_at,
                run.status,
                run.reports_processed as i64,
                run.documents_processed as i64,
                run.documents_skipped as i64,
                run.errors as i64,
                run.duration_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn job_run_count(&self) -> EngineResult<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM job_run", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Collection names become SQL identifiers, so they are restricted to
/// `[A-Za-z_][A-Za-z0-9_]*` and quoted everywhere they appear.
fn checked_name(collection: &str) -> EngineResult<&str> {
    let mut chars = collection.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        return Err(EngineError::Config {
            report: collection.to_string(),
            reason: "invalid collection name".into(),
        });
    }
    Ok(collection)
}
