//! Database schema definitions.
//!
//! Timestamps are stored as INTEGER (unix milliseconds). All DDL is
//! `IF NOT EXISTS` so applying the schema is idempotent and safe on
//! every open.

use rusqlite::{Connection, Result};

/// The complete SQL schema for the VaultSync state database.
pub const SCHEMA_SQL: &str = r"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Core Tables
-- ====================

-- File records: durable local-path to remote-document identity map
CREATE TABLE IF NOT EXISTS file_records (
    path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    remote_id TEXT,
    remote_version INTEGER,
    local_modified_at INTEGER NOT NULL,
    remote_modified_at INTEGER,
    collection TEXT NOT NULL,
    sync_state TEXT NOT NULL DEFAULT 'unsynced',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_records_state ON file_records(sync_state);
CREATE INDEX IF NOT EXISTS idx_file_records_collection ON file_records(collection);
CREATE INDEX IF NOT EXISTS idx_file_records_hash ON file_records(content_hash);

-- Dead letters: operations that exhausted retries or failed permanently
CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    op_kind TEXT NOT NULL,
    path TEXT NOT NULL,
    collection TEXT NOT NULL,
    payload TEXT,
    attempts INTEGER NOT NULL,
    error_code TEXT NOT NULL,
    error TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    replayed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_dead_letters_path ON dead_letters(path);
CREATE INDEX IF NOT EXISTS idx_dead_letters_created ON dead_letters(created_at DESC);

-- Engine metadata: small key/value facts (last reconcile time, etc.)
CREATE TABLE IF NOT EXISTS engine_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Apply the schema and connection pragmas.
///
/// WAL for concurrent readers, NORMAL sync for write throughput.
///
/// # Errors
///
/// Returns an error if any pragma or DDL statement fails.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA_SQL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_applies_to_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("schema should apply");

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('file_records', 'dead_letters', 'engine_meta', 'schema_migrations')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("first apply");
        apply_schema(&conn).expect("second apply");
    }
}
